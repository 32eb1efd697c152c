// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The handling-option engine: per-destination file transformations
//! applied to a batch of freshly collected files, plus the supporting
//! pieces (file masks, rename rules, name templates, duplicate
//! detection).

pub mod dupcheck;
pub mod mask;
pub mod namegen;
pub mod parse;
pub mod pipeline;
pub mod rules;

pub use mask::{check_name, MaskGroup};
pub use parse::{parse_options, HandlingOption};
pub use pipeline::{run_pipeline, Batch, JobMeta, PipelineContext};
pub use rules::RuleBook;
