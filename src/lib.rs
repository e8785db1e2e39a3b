//! Expose opted-in NodePort services through a fixed pool of network load
//! balancers. Each service gets one (load balancer, port) pair, a listener on
//! that port and a backend group forwarding to the service's node port.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod ledger;
pub mod provider;
pub mod reconciler;
pub mod server;
