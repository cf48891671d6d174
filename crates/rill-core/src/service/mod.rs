pub mod atomic;
pub mod cloud;
pub mod futures;
pub mod heartbeat;
pub mod key;
pub mod kv;
pub mod member_event;
pub mod member_lookup;
pub mod membership;
pub mod node;
pub mod persist;
pub mod rpc;
pub mod runtime;
pub mod timeout;
pub mod transport;
pub mod type_lookup;
pub mod value;
pub mod worker;
