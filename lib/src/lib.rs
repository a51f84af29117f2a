// Copyright 2026 The DataLad Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core library for decentralized dataset management.
//!
//! A *dataset* is a working tree managed by an external version-control
//! process plus an optional content annex holding the bytes of large files.
//! This crate models trees of nested datasets, resolves where annexed
//! content currently lives, moves content between siblings, and records
//! command executions so they can be replayed from history. The VCS and the
//! annex themselves are driven strictly as subprocesses; this crate owns
//! the orchestration, the configuration model, and the result protocol.

#![deny(unused_must_use)]

pub mod archives;
pub mod batch;
pub mod config;
pub mod credentials;
pub mod dataset;
pub mod error;
pub mod file_util;
pub mod http;
pub mod key;
pub mod lock;
pub mod remote_protocol;
pub mod rerun;
pub mod resultbus;
pub mod ria;
pub mod run;
pub mod runner;
pub mod ssh;
pub mod status;
pub mod subdataset;
pub mod transfer;
pub mod vcs;
