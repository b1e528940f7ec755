// Copyright 2025 Stratum Authors
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

//! # Stratum CLI
//!
//! Command-line runner for the stratum orchestration core.
//!
//! - **Manifests**: JSON files listing the service instances to register
//! - **Probes**: TCP-connect health checks against each instance's health endpoint
//!
//! ## Key Commands
//!
//! - `stratum run`: Start an orchestrator, register a manifest and run until Ctrl-C
//! - `stratum validate`: Check a manifest without starting anything

pub mod manifest;
pub mod probe;

pub use manifest::{load_config, Manifest};
pub use probe::TcpConnectCheck;
