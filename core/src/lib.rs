pub mod bus;
pub mod error;
pub mod filter;
pub mod persistence;
pub mod policy;
pub mod reconcile;
pub mod store;
pub mod subscriber;
pub mod watch;
pub mod world;

pub use bus::Bus;
pub use error::{PersistenceError, SendError, WorldError};
pub use policy::{AccessResult, PermissiveAgent, PolicyAgent, PolicyContext};
pub use reconcile::{run_reconcile, ReconcileSink};
pub use store::EventStore;
pub use subscriber::{PopItem, Subscriber, SubscriberId, SubscriberOptions};
pub use watch::{run_watch, WatchSink};
pub use world::World;

pub use argus_proto as proto;
