// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The retrieval planner: remote directory listings diffed against a
//! persisted per-directory retrieve list, honoring the directory's
//! filters and per-run caps. HTTP is the canonical transport.

pub mod dates;
pub mod http;
pub mod list;
pub mod listing;
pub mod planner;
pub mod sizes;

pub use http::HttpDirSource;
pub use list::{RetrieveList, RetrieveRecord};
pub use listing::{parse_listing, ListEntry, ListingError};
pub use planner::{plan_retrieval, DirPolicy, Plan, PlanError, PlanRequest, RemoteDir};
