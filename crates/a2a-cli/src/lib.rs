// Copyright 2025 A2A Broker Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # A2A CLI
//!
//! Command-line tools for running and exercising the A2A broker.
//!
//! The `a2a` binary parses its arguments with `argh` and hands off to the
//! modules here:
//!
//! - **Targets**: parsing `name[:cap,cap]=url` worker specs and building
//!   a broker configured from the environment plus command-line overrides
//! - **Demo worker**: a small axum HTTP server that speaks the broker's
//!   JSON wire format, with knobs for injecting failures and latency
//! - **Simulation**: an in-process broker driving simulated channel
//!   workers, reporting broker and metrics snapshots
//!
//! ## Key Commands
//!
//! - `a2a worker`: Serve a demo HTTP worker
//! - `a2a call`: Dispatch one envelope and print the JSON response
//! - `a2a fanout`: Dispatch to several workers and print the aggregate
//! - `a2a simulate`: Run an in-process load simulation

pub mod simulate;
pub mod target;
pub mod worker;
