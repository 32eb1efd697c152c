// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The handling-option pipeline.
//!
//! A batch is one staging directory full of regular files plus the
//! `{files_to_send, total_size}` pair every caller observes. Options run
//! in configured order; after every mutating step the batch is recounted
//! from the directory, so the pair is authoritative at pipeline end no
//! matter what an external command did to the files.

use crate::dupcheck::{self, DupStore};
use crate::namegen;
use crate::parse::{HandlingOption, LockKind, MetaFlag};
use crate::rules::RuleBook;
use chrono::Utc;
use fdist_convert::formats::{self, FormatKind};
use fdist_convert::{bulletin, convert, Conversion};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The mutable state of one staging directory.
#[derive(Debug)]
pub struct Batch {
    dir: PathBuf,
    names: Vec<String>,
    total_size: u64,
}

impl Batch {
    /// Scan the staging directory. Stray subdirectories cannot be
    /// forwarded and are removed with a warning.
    pub fn from_dir(dir: impl Into<PathBuf>) -> std::io::Result<Batch> {
        let mut batch = Batch {
            dir: dir.into(),
            names: Vec::new(),
            total_size: 0,
        };
        batch.recount()?;
        Ok(batch)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn files_to_send(&self) -> usize {
        self.names.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Re-stat the directory and rebuild names and sizes.
    pub fn recount(&mut self) -> std::io::Result<()> {
        self.names.clear();
        self.total_size = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("can't access {}: {err}", entry.path().display());
                    continue;
                }
            };
            if meta.is_file() {
                self.total_size += meta.len();
                self.names.push(name);
            } else if meta.is_dir() {
                warn!(
                    "unable to handle directories in job directories, removing {}",
                    entry.path().display()
                );
                _ = std::fs::remove_dir_all(entry.path());
            }
        }
        self.names.sort();
        Ok(())
    }

    fn clear(&mut self) {
        self.names.clear();
        self.total_size = 0;
    }
}

/// Metadata accumulated by the non-mutating options; travels with the
/// batch to the transfer side.
#[derive(Debug, Default, Clone)]
pub struct JobMeta {
    pub priority: Option<u8>,
    pub archive_time: Option<Duration>,
    pub age_limit: Option<Duration>,
    pub lock: Option<(LockKind, Option<String>)>,
    pub mail_subject: Option<String>,
    pub mail_header_file: Option<PathBuf>,
    pub mail_from: Option<String>,
    pub reply_to: Option<String>,
    pub charset: Option<String>,
    pub flags: Vec<MetaFlag>,
}

/// Everything the pipeline needs besides the batch itself.
pub struct PipelineContext<'a> {
    pub rules: &'a RuleBook,
    pub counter_file: PathBuf,
    pub crc_dir: PathBuf,
    /// Identifies the dupcheck store of this destination.
    pub job_name: String,
}

/// Run the ordered option list over the batch. Per-file errors degrade
/// the batch; only I/O failure of the staging directory itself escapes.
pub fn run_pipeline(
    batch: &mut Batch,
    options: &[HandlingOption],
    ctx: &PipelineContext<'_>,
) -> std::io::Result<JobMeta> {
    let mut meta = JobMeta::default();
    for option in options {
        match option {
            HandlingOption::Priority(priority) => meta.priority = Some(*priority),
            HandlingOption::Archive(time) => meta.archive_time = Some(*time),
            HandlingOption::AgeLimit(limit) => meta.age_limit = Some(*limit),
            HandlingOption::Lock { kind, value } => meta.lock = Some((*kind, value.clone())),
            HandlingOption::MailSubject(subject) => meta.mail_subject = Some(subject.clone()),
            HandlingOption::AddMailHeader(path) => meta.mail_header_file = Some(path.clone()),
            HandlingOption::MailFrom(from) => meta.mail_from = Some(from.clone()),
            HandlingOption::ReplyTo(to) => meta.reply_to = Some(to.clone()),
            HandlingOption::Charset(charset) => meta.charset = Some(charset.clone()),
            HandlingOption::Flag(flag) => meta.flags.push(*flag),

            HandlingOption::Chmod(mode) => chmod_all(batch, *mode),
            HandlingOption::Chown { user, group } => chown_all(batch, user, group.as_deref()),

            HandlingOption::Basename { overwrite } => {
                rename_each(batch, *overwrite, |name| {
                    Some(name.split('.').next().unwrap_or(name).to_string())
                })?;
            }
            HandlingOption::Extension { overwrite } => {
                rename_each(batch, *overwrite, |name| {
                    name.rsplit_once('.').map(|(stem, _)| stem.to_string())
                })?;
            }
            HandlingOption::AddPrefix(prefix) => {
                rename_each(batch, false, |name| Some(format!("{prefix}{name}")))?;
            }
            HandlingOption::DelPrefix(prefix) => {
                rename_each(batch, false, |name| {
                    name.strip_prefix(prefix.as_str()).map(String::from)
                })?;
            }
            HandlingOption::ToUpper => {
                rename_each(batch, false, |name| Some(name.to_ascii_uppercase()))?;
            }
            HandlingOption::ToLower => {
                rename_each(batch, false, |name| Some(name.to_ascii_lowercase()))?;
            }
            HandlingOption::Rename { rule, overwrite } => {
                if ctx.rules.is_empty() {
                    warn!("renaming requested but there are no rename rules, ignoring");
                    continue;
                }
                if ctx.rules.get(rule).is_none() {
                    warn!("could not find rename rule {rule}, ignoring this option");
                    continue;
                }
                let now = Utc::now();
                rename_each(batch, *overwrite, |name| {
                    ctx.rules.apply(rule, name, now, &ctx.counter_file)
                })?;
            }

            HandlingOption::Exec {
                command,
                delete_source,
                delete_all_on_error,
                log_output,
                timeout,
            } => {
                run_exec(
                    batch,
                    command,
                    *delete_source,
                    *delete_all_on_error,
                    *log_output,
                    *timeout,
                )?;
            }

            HandlingOption::Extract(kind) => {
                run_extract(batch, *kind)?;
            }
            HandlingOption::Assemble { kind, name_rule } => {
                run_assemble(batch, *kind, name_rule, ctx)?;
            }
            HandlingOption::Convert(conversion) => {
                run_convert(batch, *conversion)?;
            }
            HandlingOption::Tiff2Gts => run_format(batch, FormatKind::Tiff2Gts)?,
            HandlingOption::Gts2Tiff => run_format(batch, FormatKind::Gts2Tiff)?,
            HandlingOption::Fax2Gts => run_format(batch, FormatKind::Fax2Gts)?,
            HandlingOption::Wmo2Ascii => run_format(batch, FormatKind::Wmo2Ascii)?,
            HandlingOption::Afw2Wmo => run_format(batch, FormatKind::Afw2Wmo)?,
            HandlingOption::Grib2Wmo { cccc: _ } => run_format(batch, FormatKind::Grib2Wmo)?,

            HandlingOption::DupCheck {
                timeout,
                by_content,
            } => {
                run_dupcheck(batch, *timeout, *by_content, ctx)?;
            }
        }
    }
    Ok(meta)
}

/// Apply a per-name rename function across the batch, then recount.
///
/// A target that already exists is either replaced (`overwrite`, with its
/// bytes leaving the batch via the recount) or dodged by appending `;N`
/// with the smallest `N` that is free.
fn rename_each(
    batch: &mut Batch,
    overwrite: bool,
    new_name: impl Fn(&str) -> Option<String>,
) -> std::io::Result<()> {
    let mut touched = false;
    for index in 0..batch.names.len() {
        let name = batch.names[index].clone();
        let Some(desired) = new_name(&name) else {
            continue;
        };
        if desired == name || desired.is_empty() {
            continue;
        }
        let source = batch.dir.join(&name);
        let target_name = if overwrite {
            desired
        } else {
            uncollided_name(&batch.dir, &desired)
        };
        match std::fs::rename(&source, batch.dir.join(&target_name)) {
            Ok(()) => {
                batch.names[index] = target_name;
                touched = true;
            }
            Err(err) => {
                warn!("failed to rename {} to {target_name}: {err}", name);
            }
        }
    }
    if touched {
        batch.recount()?;
    }
    Ok(())
}

/// Find the first free variant of `desired`: the name itself, then
/// `name;0`, `name;1`, …
fn uncollided_name(dir: &Path, desired: &str) -> String {
    if !dir.join(desired).exists() {
        return desired.to_string();
    }
    let mut counter = 0u32;
    loop {
        let candidate = format!("{desired};{counter}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn run_exec(
    batch: &mut Batch,
    command: &str,
    delete_source: bool,
    delete_all_on_error: bool,
    log_output: bool,
    timeout: Option<Duration>,
) -> std::io::Result<()> {
    let per_file = command.contains("%s");
    let mut failed = false;

    if per_file {
        for name in batch.names.clone() {
            let quoted = if name.contains(';') || name.contains(' ') {
                format!("\"{name}\"")
            } else {
                name.clone()
            };
            let line = command.replace("%s", &quoted);
            if !run_command(&batch.dir, &line, timeout, log_output) {
                failed = true;
            }
            if delete_source {
                if let Err(err) = std::fs::remove_file(batch.dir.join(&name)) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to unlink {name}: {err}");
                    }
                }
            }
        }
    } else {
        failed = !run_command(&batch.dir, command, timeout, log_output);
        if delete_source {
            for name in batch.names.clone() {
                if let Err(err) = std::fs::remove_file(batch.dir.join(&name)) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to unlink {name}: {err}");
                    }
                }
            }
        }
    }

    if failed && delete_all_on_error {
        delete_all_files(&batch.dir);
        batch.clear();
        return Ok(());
    }
    // Recount regardless of the exit status; even a failing command may
    // have created or removed files.
    batch.recount()
}

/// Run one shell line in the batch directory. Returns success.
fn run_command(dir: &Path, line: &str, timeout: Option<Duration>, log_output: bool) -> bool {
    let mut child = match std::process::Command::new("sh")
        .arg("-c")
        .arg(line)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!("failed to execute command {line}: {err}");
            return false;
        }
    };

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if let Some(timeout) = timeout {
                    if started.elapsed() > timeout {
                        warn!("command {line} exceeded its {}s limit, killing", timeout.as_secs());
                        _ = child.kill();
                        _ = child.wait();
                        return false;
                    }
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                warn!("failed waiting for command {line}: {err}");
                return false;
            }
        }
    };

    if let Ok(output) = child.wait_with_output() {
        if log_output && !output.stdout.is_empty() {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                debug!("exec: {line}");
            }
        }
        if !status.success() && !output.stderr.is_empty() {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                warn!("exec: {line}");
            }
        }
    }
    if !status.success() {
        warn!("failed to execute command {line} [return code = {:?}]", status.code());
    }
    status.success()
}

fn delete_all_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!("can't access directory {}", dir.display());
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = result {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}

fn run_extract(batch: &mut Batch, kind: bulletin::ExtractKind) -> std::io::Result<()> {
    let mut bulletin_index = 0usize;
    for name in batch.names.clone() {
        let path = batch.dir.join(&name);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("can't read {name} for extracting: {err}");
                continue;
            }
        };
        match bulletin::extract(&contents, kind) {
            Ok(bulletins) => {
                for body in &bulletins {
                    let out_name =
                        uncollided_name(&batch.dir, &bulletin::bulletin_name(body, bulletin_index));
                    bulletin_index += 1;
                    if let Err(err) = std::fs::write(batch.dir.join(&out_name), body) {
                        warn!("failed to write bulletin {out_name}: {err}");
                    }
                }
                _ = std::fs::remove_file(&path);
            }
            Err(err) => {
                warn!("error extracting bulletins from {name}, deleting file: {err}");
                _ = std::fs::remove_file(&path);
            }
        }
    }
    batch.recount()
}

fn run_assemble(
    batch: &mut Batch,
    kind: bulletin::AssembleKind,
    name_rule: &str,
    ctx: &PipelineContext<'_>,
) -> std::io::Result<()> {
    let assembled_name = if name_rule.is_empty() {
        warn!("no file name set for assemble option, using <no_file_name>");
        "no_file_name".to_string()
    } else {
        namegen::expand_template(name_rule, Utc::now(), &ctx.counter_file)
            .unwrap_or_else(|| "no_file_name".to_string())
    };

    let mut bodies = Vec::with_capacity(batch.names.len());
    for name in &batch.names {
        match std::fs::read(batch.dir.join(name)) {
            Ok(contents) => bodies.push(contents),
            Err(err) => warn!("can't read {name} for assembling: {err}"),
        }
    }
    let container = bulletin::assemble(&bodies, kind);

    for name in batch.names.clone() {
        _ = std::fs::remove_file(batch.dir.join(&name));
    }
    std::fs::write(batch.dir.join(&assembled_name), container)?;
    batch.recount()
}

fn run_convert(batch: &mut Batch, conversion: Conversion) -> std::io::Result<()> {
    for name in batch.names.clone() {
        if let Err(err) = convert(&batch.dir, &name, conversion) {
            warn!("unable to convert file {name}: {err}");
        }
    }
    batch.recount()
}

fn run_format(batch: &mut Batch, kind: FormatKind) -> std::io::Result<()> {
    for name in batch.names.clone() {
        let path = batch.dir.join(&name);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("can't read {name}: {err}");
                continue;
            }
        };
        match formats::apply(&contents, kind) {
            Ok(out) => {
                let tmp = batch.dir.join(format!("{name}.tmpnewname"));
                std::fs::write(&tmp, &out)?;
                std::fs::rename(&tmp, &path)?;
            }
            Err(err) => {
                warn!("removing corrupt file {name}: {err}");
                _ = std::fs::remove_file(&path);
            }
        }
    }
    batch.recount()
}

fn run_dupcheck(
    batch: &mut Batch,
    timeout: Duration,
    by_content: bool,
    ctx: &PipelineContext<'_>,
) -> std::io::Result<()> {
    let mut store = DupStore::open(&ctx.crc_dir, &ctx.job_name, timeout);
    let now = Utc::now().timestamp();
    for name in batch.names.clone() {
        let fingerprint = match dupcheck::fingerprint(&batch.dir, &name, by_content) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                warn!("can't fingerprint {name}: {err}");
                continue;
            }
        };
        if store.check_and_insert(&fingerprint, now) {
            debug!("dropping duplicate {name}");
            _ = std::fs::remove_file(batch.dir.join(&name));
        }
    }
    store.persist();
    batch.recount()
}

fn chmod_all(batch: &Batch, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    for name in &batch.names {
        let path = batch.dir.join(name);
        if let Err(err) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)) {
            warn!("failed to chmod {name}: {err}");
        }
    }
}

fn chown_all(batch: &Batch, user: &str, group: Option<&str>) {
    let uid = match nix::unistd::User::from_name(user) {
        Ok(Some(user)) => Some(user.uid),
        _ => {
            warn!("unknown user {user} for chown, ignoring");
            return;
        }
    };
    let gid = group.and_then(|g| match nix::unistd::Group::from_name(g) {
        Ok(Some(group)) => Some(group.gid),
        _ => {
            warn!("unknown group {g} for chown");
            None
        }
    });
    for name in &batch.names {
        let path = batch.dir.join(name);
        if let Err(err) = nix::unistd::chown(&path, uid, gid) {
            warn!("failed to chown {name}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_options;

    fn context<'a>(rules: &'a RuleBook, dir: &tempfile::TempDir) -> PipelineContext<'a> {
        let crc = dir.path().join("crc");
        std::fs::create_dir_all(&crc).unwrap();
        PipelineContext {
            rules,
            counter_file: dir.path().join("COUNTER"),
            crc_dir: crc,
            job_name: "test-job".into(),
        }
    }

    fn staging(dir: &tempfile::TempDir, files: &[(&str, &[u8])]) -> Batch {
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        for (name, contents) in files {
            std::fs::write(staging.join(name), contents).unwrap();
        }
        Batch::from_dir(&staging).unwrap()
    }

    #[test]
    fn test_empty_pipeline_is_a_noop() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("a.txt", b"aaa"), ("b.txt", b"bb")]);

        run_pipeline(&mut batch, &[], &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 2);
        assert_eq!(batch.total_size(), 5);
        assert_eq!(batch.names(), ["a.txt", "b.txt"]);
    }

    #[test]
    fn test_basename_overwrite_scenario() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(
            &support,
            &[("a.txt.1", b"11111"), ("a.txt.2", b"222"), ("b.txt", b"4444")],
        );

        let options = parse_options("basename overwrite\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();

        assert_eq!(batch.files_to_send(), 2);
        let mut names = batch.names().to_vec();
        names.sort();
        assert_eq!(names, ["a", "b"]);
        // One of the two a.txt.* files survived; its size plus b's.
        let a_len = std::fs::metadata(batch.dir().join("a")).unwrap().len();
        assert!(a_len == 5 || a_len == 3);
        assert_eq!(batch.total_size(), a_len + 4);
    }

    #[test]
    fn test_basename_without_overwrite_suffixes() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("a.txt.1", b"1"), ("a.txt.2", b"2")]);

        let options = parse_options("basename\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();

        assert_eq!(batch.files_to_send(), 2);
        let mut names = batch.names().to_vec();
        names.sort();
        assert_eq!(names, ["a", "a;0"]);
    }

    #[test]
    fn test_prefix_and_case_folding() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("File.DAT", b"x")]);

        let options = parse_options("prefix add out_\ntolower\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.names(), ["out_file.dat"]);

        let options = parse_options("prefix del out_\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.names(), ["file.dat"]);
    }

    #[test]
    fn test_rename_rule_applies_first_match() {
        let support = tempfile::tempdir().unwrap();
        let rule_file = support.path().join("rename.rule");
        std::fs::write(&rule_file, "[r]\n*.txt  doc_*\n").unwrap();
        let rules = RuleBook::load(&rule_file);
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("x.txt", b"x"), ("keep.dat", b"k")]);

        let options = parse_options("rename r\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        let mut names = batch.names().to_vec();
        names.sort();
        assert_eq!(names, ["doc_x", "keep.dat"]);
    }

    #[test]
    fn test_missing_rename_rule_is_skipped() {
        let support = tempfile::tempdir().unwrap();
        let rule_file = support.path().join("rename.rule");
        std::fs::write(&rule_file, "[other]\n*  x_*\n").unwrap();
        let rules = RuleBook::load(&rule_file);
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("x.txt", b"x")]);

        let options = parse_options("rename missing\ntoupper\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        // The bad rename was skipped, the next option still ran.
        assert_eq!(batch.names(), ["X.TXT"]);
    }

    #[test]
    fn test_exec_runs_per_file_and_recounts() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("one", b"data")]);

        let options = parse_options("exec cp %s %s.copy\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 2);
        assert!(batch.dir().join("one.copy").exists());
    }

    #[test]
    fn test_exec_delete_all_on_error() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("one", b"data"), ("two", b"more")]);

        let options = parse_options("execD false\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 0);
        assert_eq!(batch.total_size(), 0);
        assert!(std::fs::read_dir(batch.dir()).unwrap().next().is_none());
    }

    #[test]
    fn test_exec_timeout_kills_command() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("one", b"data")]);

        let started = Instant::now();
        let options = parse_options("exec -t 1 sleep 30\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        // The file survived the failed exec.
        assert_eq!(batch.files_to_send(), 1);
    }

    #[test]
    fn test_extract_splits_and_removes_source() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);

        let bulletins = vec![b"FIRST BULLETIN".to_vec(), b"SECOND".to_vec()];
        let container = bulletin::assemble(&bulletins, bulletin::AssembleKind::Vax);
        let mut batch = staging(&support, &[("container", &container)]);

        let options = parse_options("extract VAX\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 2);
        assert!(!batch.dir().join("container").exists());
        assert_eq!(
            batch.total_size(),
            bulletins.iter().map(|b| b.len() as u64).sum::<u64>()
        );
    }

    #[test]
    fn test_extract_corrupt_file_is_removed() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        // A VAX length indicator pointing past the end of the file.
        let mut batch = staging(&support, &[("bad", &[255, 255, b'x'])]);

        let options = parse_options("extract VAX\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 0);
        assert_eq!(batch.total_size(), 0);
    }

    #[test]
    fn test_assemble_concatenates_batch() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("a", b"AAA"), ("b", b"BB")]);

        let options = parse_options("assemble WMO bundle_%n\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 1);
        assert_eq!(batch.names(), ["bundle_0001"]);
        let contents = std::fs::read(batch.dir().join("bundle_0001")).unwrap();
        assert_eq!(&contents[..10], b"0000000301");
    }

    #[test]
    fn test_convert_step_changes_sizes() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("msg", b"HELLO")]);

        let options = parse_options("convert wmo\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(batch.files_to_send(), 1);
        assert_eq!(batch.total_size(), 15);
    }

    #[test]
    fn test_dupcheck_drops_duplicates() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(
            &support,
            &[("first", b"same bytes"), ("second", b"same bytes"), ("third", b"different")],
        );

        let options = parse_options("dupcheck 3600 content\n");
        run_pipeline(&mut batch, &options, &ctx).unwrap();
        // One of the two identical files is gone.
        assert_eq!(batch.files_to_send(), 2);
    }

    #[test]
    fn test_metadata_options_accumulate() {
        let support = tempfile::tempdir().unwrap();
        let rules = RuleBook::empty();
        let ctx = context(&rules, &support);
        let mut batch = staging(&support, &[("x", b"x")]);

        let options =
            parse_options("priority 3\narchive 1h\nage-limit 600\nsubject test mail\nmirror\n");
        let meta = run_pipeline(&mut batch, &options, &ctx).unwrap();
        assert_eq!(meta.priority, Some(3));
        assert_eq!(meta.archive_time, Some(Duration::from_secs(3600)));
        assert_eq!(meta.age_limit, Some(Duration::from_secs(600)));
        assert_eq!(meta.mail_subject.as_deref(), Some("test mail"));
        assert_eq!(meta.flags, vec![MetaFlag::Mirror]);
        // Metadata options never touch the files.
        assert_eq!(batch.files_to_send(), 1);
    }
}
