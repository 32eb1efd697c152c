// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Syntax validation of handling options.
//!
//! Options arrive one per line in the per-destination configuration; this
//! module turns them into the typed [`HandlingOption`] list the pipeline
//! executes. Unknown or malformed options are skipped with a warning so
//! a configuration typo never takes the directory out of service.

use fdist_convert::bulletin::{AssembleKind, ExtractKind};
use fdist_convert::Conversion;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Write under a dot-prefixed name, rename when complete.
    DotLock,
    /// Remove the dot-prefix lock convention.
    Unlock,
    /// Write under the final name plus a postfix, rename when complete.
    Postfix,
}

/// Metadata-only switches that only tag the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaFlag {
    Delete,
    ForceCopy,
    CreateTargetDir,
    DontCreateTargetDir,
    Mirror,
    OutputLog,
    SequenceLocking,
    PassiveFtp,
    ActiveFtp,
    FileNameIsSubject,
    FileNameIsHeader,
    FileNameIsUser,
    FileNameIsTarget,
    AttachFile,
    AttachAllFiles,
    EncodeAnsi,
    EumetsatHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlingOption {
    Priority(u8),
    Archive(Duration),
    AgeLimit(Duration),
    Lock { kind: LockKind, value: Option<String> },
    Basename { overwrite: bool },
    Extension { overwrite: bool },
    AddPrefix(String),
    DelPrefix(String),
    ToUpper,
    ToLower,
    Rename { rule: String, overwrite: bool },
    Exec {
        command: String,
        delete_source: bool,
        delete_all_on_error: bool,
        log_output: bool,
        timeout: Option<Duration>,
    },
    Extract(ExtractKind),
    Assemble { kind: AssembleKind, name_rule: String },
    Convert(Conversion),
    Chmod(u32),
    Chown { user: String, group: Option<String> },
    MailSubject(String),
    AddMailHeader(PathBuf),
    MailFrom(String),
    ReplyTo(String),
    Charset(String),
    Tiff2Gts,
    Gts2Tiff,
    Fax2Gts,
    Wmo2Ascii,
    Afw2Wmo,
    Grib2Wmo { cccc: Option<String> },
    DupCheck { timeout: Duration, by_content: bool },
    Flag(MetaFlag),
}

impl HandlingOption {
    /// Whether executing this option can change file names or contents,
    /// i.e. whether the batch counts need attention afterwards.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            HandlingOption::Priority(_)
                | HandlingOption::Archive(_)
                | HandlingOption::AgeLimit(_)
                | HandlingOption::Lock { .. }
                | HandlingOption::MailSubject(_)
                | HandlingOption::AddMailHeader(_)
                | HandlingOption::MailFrom(_)
                | HandlingOption::ReplyTo(_)
                | HandlingOption::Charset(_)
                | HandlingOption::Chmod(_)
                | HandlingOption::Chown { .. }
                | HandlingOption::Flag(_)
        )
    }
}

/// Parse the option block of one destination. Order is preserved.
pub fn parse_options(lines: &str) -> Vec<HandlingOption> {
    let mut out = Vec::new();
    for line in lines.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_option(line) {
            Some(option) => out.push(option),
            None => warn!(sign = "CONFIG", "unknown or malformed option, ignoring: {line}"),
        }
    }
    out
}

fn parse_option(line: &str) -> Option<HandlingOption> {
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    };

    Some(match keyword {
        "priority" => HandlingOption::Priority(rest.parse().ok()?),
        "archive" => HandlingOption::Archive(parse_archive_time(rest)?),
        "age-limit" => HandlingOption::AgeLimit(Duration::from_secs(rest.parse().ok()?)),
        "lock" => HandlingOption::Lock {
            kind: LockKind::DotLock,
            value: non_empty(rest),
        },
        "ulock" => HandlingOption::Lock {
            kind: LockKind::Unlock,
            value: non_empty(rest),
        },
        "lockp" => HandlingOption::Lock {
            kind: LockKind::Postfix,
            value: Some(non_empty(rest)?),
        },
        "basename" => HandlingOption::Basename {
            overwrite: rest == "overwrite",
        },
        "extension" => HandlingOption::Extension {
            overwrite: rest == "overwrite",
        },
        "prefix" => {
            let (mode, prefix) = rest.split_once(char::is_whitespace)?;
            let prefix = prefix.trim().to_string();
            match mode {
                "add" => HandlingOption::AddPrefix(prefix),
                "del" => HandlingOption::DelPrefix(prefix),
                _ => return None,
            }
        }
        "toupper" => HandlingOption::ToUpper,
        "tolower" => HandlingOption::ToLower,
        "rename" => {
            let mut parts = rest.split_whitespace();
            let rule = parts.next()?.to_string();
            let overwrite = parts.next() == Some("overwrite");
            HandlingOption::Rename { rule, overwrite }
        }
        "exec" | "execd" | "execD" => {
            let mut delete_source = keyword == "execd";
            let mut delete_all_on_error = keyword == "execD";
            let mut log_output = false;
            let mut timeout = None;
            let mut rest = rest;
            loop {
                let (flag, tail) = match rest.split_once(char::is_whitespace) {
                    Some((flag, tail)) => (flag, tail.trim_start()),
                    None => (rest, ""),
                };
                match flag {
                    "d" if keyword == "exec" => delete_source = true,
                    "D" if keyword == "exec" => delete_all_on_error = true,
                    "-l" | "-L" => log_output = true,
                    "-t" => {
                        let (secs, tail) = match tail.split_once(char::is_whitespace) {
                            Some((secs, tail)) => (secs, tail.trim_start()),
                            None => (tail, ""),
                        };
                        timeout = Some(Duration::from_secs(secs.parse().ok()?));
                        rest = tail;
                        continue;
                    }
                    _ => break,
                }
                rest = tail;
            }
            if rest.is_empty() {
                warn!(sign = "CONFIG", "no command specified for executing, ignoring");
                return None;
            }
            HandlingOption::Exec {
                command: rest.to_string(),
                delete_source,
                delete_all_on_error,
                log_output,
                timeout,
            }
        }
        "extract" => HandlingOption::Extract(ExtractKind::parse(rest)?),
        "assemble" => {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let kind = AssembleKind::parse(parts.next()?)?;
            let name_rule = parts.next().unwrap_or("").trim().to_string();
            HandlingOption::Assemble { kind, name_rule }
        }
        "convert" => HandlingOption::Convert(Conversion::parse(rest)?),
        "chmod" => HandlingOption::Chmod(u32::from_str_radix(rest, 8).ok()?),
        "chown" => {
            let (user, group) = match rest.split_once(':') {
                Some((user, group)) => (user.to_string(), Some(group.to_string())),
                None => (rest.to_string(), None),
            };
            if user.is_empty() {
                return None;
            }
            HandlingOption::Chown { user, group }
        }
        "subject" => HandlingOption::MailSubject(non_empty(rest)?),
        "add-mail-header" => HandlingOption::AddMailHeader(PathBuf::from(non_empty(rest)?)),
        "from" => HandlingOption::MailFrom(non_empty(rest)?),
        "reply-to" => HandlingOption::ReplyTo(non_empty(rest)?),
        "charset" => HandlingOption::Charset(non_empty(rest)?),
        "tiff2gts" => HandlingOption::Tiff2Gts,
        "gts2tiff" => HandlingOption::Gts2Tiff,
        "fax2gts" => HandlingOption::Fax2Gts,
        "wmo2ascii" => HandlingOption::Wmo2Ascii,
        "afw2wmo" => HandlingOption::Afw2Wmo,
        "grib2wmo" => HandlingOption::Grib2Wmo {
            cccc: non_empty(rest),
        },
        "dupcheck" => {
            let mut timeout = Duration::from_secs(3600);
            let mut by_content = true;
            for part in rest.split_whitespace() {
                match part {
                    "name" => by_content = false,
                    "content" => by_content = true,
                    secs => timeout = Duration::from_secs(secs.parse().ok()?),
                }
            }
            HandlingOption::DupCheck { timeout, by_content }
        }
        "delete" => HandlingOption::Flag(MetaFlag::Delete),
        "force-copy" => HandlingOption::Flag(MetaFlag::ForceCopy),
        "create-target-dir" => HandlingOption::Flag(MetaFlag::CreateTargetDir),
        "dont-create-target-dir" => HandlingOption::Flag(MetaFlag::DontCreateTargetDir),
        "mirror" => HandlingOption::Flag(MetaFlag::Mirror),
        "output-log" => HandlingOption::Flag(MetaFlag::OutputLog),
        "sequence-locking" => HandlingOption::Flag(MetaFlag::SequenceLocking),
        "passive-ftp" => HandlingOption::Flag(MetaFlag::PassiveFtp),
        "active-ftp" => HandlingOption::Flag(MetaFlag::ActiveFtp),
        "file-name-is-subject" => HandlingOption::Flag(MetaFlag::FileNameIsSubject),
        "file-name-is-header" => HandlingOption::Flag(MetaFlag::FileNameIsHeader),
        "file-name-is-user" => HandlingOption::Flag(MetaFlag::FileNameIsUser),
        "file-name-is-target" => HandlingOption::Flag(MetaFlag::FileNameIsTarget),
        "attach-file" => HandlingOption::Flag(MetaFlag::AttachFile),
        "attach-all-files" => HandlingOption::Flag(MetaFlag::AttachAllFiles),
        "encode-ansi" => HandlingOption::Flag(MetaFlag::EncodeAnsi),
        "eumetsat-header" => HandlingOption::Flag(MetaFlag::EumetsatHeader),
        _ => return None,
    })
}

/// Archive times carry a unit suffix: days, hours, minutes or seconds.
fn parse_archive_time(value: &str) -> Option<Duration> {
    if value.is_empty() {
        return None;
    }
    let (number, multiplier) = match value.as_bytes()[value.len() - 1] {
        b'd' => (&value[..value.len() - 1], 86_400),
        b'h' => (&value[..value.len() - 1], 3_600),
        b'm' => (&value[..value.len() - 1], 60),
        b's' => (&value[..value.len() - 1], 1),
        _ => (value, 1),
    };
    Some(Duration::from_secs(number.parse::<u64>().ok()? * multiplier))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rename_and_basename() {
        let options = parse_options("rename weather overwrite\nbasename\nextension overwrite\n");
        assert_eq!(
            options,
            vec![
                HandlingOption::Rename {
                    rule: "weather".into(),
                    overwrite: true
                },
                HandlingOption::Basename { overwrite: false },
                HandlingOption::Extension { overwrite: true },
            ]
        );
    }

    #[test]
    fn test_parse_exec_variants() {
        match parse_option("exec d -t 30 gzip %s") {
            Some(HandlingOption::Exec {
                command,
                delete_source,
                delete_all_on_error,
                timeout,
                ..
            }) => {
                assert_eq!(command, "gzip %s");
                assert!(delete_source);
                assert!(!delete_all_on_error);
                assert_eq!(timeout, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
        match parse_option("execD check_valid %s") {
            Some(HandlingOption::Exec {
                delete_all_on_error,
                ..
            }) => assert!(delete_all_on_error),
            other => panic!("unexpected parse: {other:?}"),
        }
        assert!(parse_option("exec").is_none());
    }

    #[test]
    fn test_parse_archive_units() {
        assert_eq!(
            parse_option("archive 2d"),
            Some(HandlingOption::Archive(Duration::from_secs(172_800)))
        );
        assert_eq!(
            parse_option("archive 90m"),
            Some(HandlingOption::Archive(Duration::from_secs(5_400)))
        );
        assert_eq!(
            parse_option("archive 15"),
            Some(HandlingOption::Archive(Duration::from_secs(15)))
        );
    }

    #[test]
    fn test_parse_extract_empty_id_is_legacy_mrz() {
        assert_eq!(
            parse_option("extract"),
            Some(HandlingOption::Extract(ExtractKind::Mrz))
        );
        assert_eq!(
            parse_option("extract WMO"),
            Some(HandlingOption::Extract(ExtractKind::WmoStandard))
        );
        assert!(parse_option("extract BOGUS").is_none());
    }

    #[test]
    fn test_parse_assemble_with_name_rule() {
        assert_eq!(
            parse_option("assemble WMO out_%n"),
            Some(HandlingOption::Assemble {
                kind: AssembleKind::WmoStandard,
                name_rule: "out_%n".into()
            })
        );
    }

    #[test]
    fn test_parse_chmod_chown() {
        assert_eq!(parse_option("chmod 644"), Some(HandlingOption::Chmod(0o644)));
        assert_eq!(
            parse_option("chown afd:ops"),
            Some(HandlingOption::Chown {
                user: "afd".into(),
                group: Some("ops".into())
            })
        );
    }

    #[test]
    fn test_unknown_options_are_dropped() {
        let options = parse_options("priority 5\nfrobnicate hard\ntolower\n");
        assert_eq!(
            options,
            vec![HandlingOption::Priority(5), HandlingOption::ToLower]
        );
    }

    #[test]
    fn test_mutating_classification() {
        assert!(!HandlingOption::Priority(3).is_mutating());
        assert!(!HandlingOption::Chmod(0o600).is_mutating());
        assert!(HandlingOption::ToUpper.is_mutating());
        assert!(HandlingOption::Convert(Conversion::Wmo).is_mutating());
    }
}
