//! A ring-structured distributed hash table with a central coordinator.
//!
//! Nodes identified by `n<key>` form a logical ring sorted by key.
//! A coordinator (`bootstrap`) admits nodes, tells every affected node its predecessor and successor,
//! passes client requests to the node with the lowest key and relays results back to the client.
//! A request travels clockwise from node to node until it reaches the first node whose key is not
//! below the object identifier. That node records the object in its object file, or reports whether it is there.
//!
//! # Main executable:
//! The main executable `ring_dht` takes one command line argument, `-c <config>`,
//! where `<config>` is the path to a configuration file in the INI format:
//! ```ini
//! [dht]
//! role = node
//! peer_id = n10
//! listen_address = 0.0.0.0:8888
//! coordinator = bootstrap
//! client = client
//! object_file = objects.txt
//! delay = 0.5
//!
//! [addresses]
//! bootstrap = 127.0.0.1:8000
//! ```
//! `role` is one of `coordinator`, `node` or `client`.
//! Clients send the request selected by `testcase` (see [`client::scripted_request`])
//! and print every result they receive. All options are listed in [`config`].
//!
//! To run the program, you may use:
//! ```bash
//! cargo run --release -- -c node.ini
//! ```
//! The default log level is `info`, which logs ring changes, stored objects and results.
//! You can change it by setting the `RUST_LOG` environment variable to `error`, `warn`, `info`, `debug` or `trace`.
//!
//! ## Testing:
//! Unit tests live next to the code they test, tests running a whole ring over local
//! TCP connections are in the `testing` module:
//! ```bash
//! cargo test --release
//! ```
//!
//! Below, you will find links to the modules of this crate:
pub mod client;
pub mod config;
pub mod coordinator;
pub mod node;
pub mod peer_communication;
#[cfg(test)]
mod testing;
