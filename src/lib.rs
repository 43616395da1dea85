//! mpbench - multi-process orchestration for GPU compute microbenchmarks
//!
//! Benchmarks that exercise inter-process memory and event sharing need
//! several cooperating processes: a coordinator that owns shared resources
//! and a set of worker ranks that import them. This crate provides the
//! pieces in between.
//!
//! # Quick Start
//!
//! ```no_run
//! use mpbench::prelude::*;
//!
//! let config = Config::builder()
//!     .strategy(Strategy::Socket)
//!     .socket_dir("/tmp")
//!     .build()
//!     .unwrap();
//!
//! let params = Heat3dParams {
//!     sub_domains: [2, 1, 1],
//!     mesh_length: 32,
//!     ..Default::default()
//! };
//!
//! let statistics = Statistics::new();
//! let result = heat3d::run_master(&HostBackend::new(), &params, &config, &statistics).unwrap();
//! println!("{result}");
//! ```
//!
//! # Modules
//!
//! - **ipc**: fixed-size handles, hex transport, descriptor passing over
//!   Unix sockets (`SCM_RIGHTS`) or by pid (`pidfd_getfd`)
//! - **backend**: the device operations the protocols need, with a
//!   shared-memory host implementation
//! - **barrier**: N-way barrier over `2 * n_ranks` shared events
//! - **process**: launching a group of workers, pipe synchronization points
//!   and measurement collection
//! - **heat3d**: the distributed halo-exchange benchmark
//! - **stats**: measurement series, summaries and exporters

#![warn(missing_debug_implementations)]

pub mod backend;
pub mod barrier;
pub mod config;
pub mod error;
pub mod heat3d;
pub mod ipc;
pub mod prelude;
pub mod process;
pub mod result;
pub mod stats;
pub mod util;

pub use config::{Config, ConfigBuilder, Strategy};
pub use error::{Error, Result};
pub use result::TestResult;
