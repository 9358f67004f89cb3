pub mod correlation;
pub mod gateway;
pub mod rpc;
pub mod worker;
