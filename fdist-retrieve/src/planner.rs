// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The retrieval planner: turn a remote directory listing into the
//! minimal set of files to fetch this cycle, persisted so a helper
//! worker can resume the plan.

use crate::dates;
use crate::list::RetrieveList;
use crate::listing::{self, ListingError};
use fdist_common::MAX_FILENAME_LENGTH;
use fdist_options::mask::{check_name, MaskGroup};
use fdist_options::namegen;
use fdist_status::{GtLtSign, StoreError, StupidMode};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("listing failed: {0}")]
    Listing(#[from] ListingError),
    #[error("transfer failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the remote side must answer during a scan.
pub trait RemoteDir {
    /// Fetch the directory listing body.
    fn list(&mut self) -> impl std::future::Future<Output = Result<String, PlanError>> + Send;
    /// Learn (size, mtime) of one file.
    fn head(
        &mut self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<(Option<i64>, Option<i64>), PlanError>> + Send;
}

/// The per-directory policy snapshot the planner consults.
#[derive(Debug, Clone)]
pub struct DirPolicy {
    pub ignore_size: i64,
    pub size_sign: GtLtSign,
    pub ignore_file_time: i64,
    pub time_sign: GtLtSign,
    pub max_copied_files: u32,
    pub max_copied_file_size: u64,
    pub stupid_mode: StupidMode,
    pub remove: bool,
    pub dont_get_dir_list: bool,
    pub accept_dot_files: bool,
}

/// How this planner run was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    /// A previous run left unassigned eligible entries behind.
    pub more_files_in_list: bool,
    /// This worker only helps drain an existing plan.
    pub distributed_helper: bool,
    /// Retry of an old error job (entries of other workers are locked).
    pub old_error_job: bool,
    /// Which transfer slot this worker occupies; recorded in `assigned`.
    pub job_no: u8,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub files_to_retrieve: u32,
    pub size_to_retrieve: u64,
    pub more_files_in_list: bool,
}

struct Caps<'a> {
    policy: &'a DirPolicy,
}

impl Caps<'_> {
    fn within(&self, plan: &Plan) -> bool {
        plan.files_to_retrieve < self.policy.max_copied_files
            && plan.size_to_retrieve < self.policy.max_copied_file_size
    }
}

/// Decide which files to fetch. Mutations to the persisted list happen
/// under per-entry locks; the caller owns the directory assignment.
pub async fn plan_retrieval<R: RemoteDir>(
    remote: &mut R,
    list: &mut RetrieveList,
    policy: &DirPolicy,
    masks: &[MaskGroup],
    request: PlanRequest,
) -> Result<Plan, PlanError> {
    let now = dates::unix_now();
    if request.more_files_in_list || request.distributed_helper || request.old_error_job {
        resume_plan(remote, list, policy, request, now).await
    } else {
        full_scan(remote, list, policy, masks, request, now).await
    }
}

/// Resume path: no listing, just walk the persisted entries.
async fn resume_plan<R: RemoteDir>(
    remote: &mut R,
    list: &mut RetrieveList,
    policy: &DirPolicy,
    request: PlanRequest,
    now: i64,
) -> Result<Plan, PlanError> {
    let caps = Caps { policy };
    let mut plan = Plan::default();

    for index in list.occupied() {
        let record = list.get(index)?;
        if record.retrieved != 0 || record.assigned != 0 {
            continue;
        }
        if !caps.within(&plan) {
            plan.more_files_in_list = true;
            break;
        }
        let Some(_guard) = list.try_lock_entry(index)? else {
            continue;
        };
        if record.mtime == -1 || record.size == -1 {
            let (size, mtime) = remote.head(record.name()).await?;
            list.update(index, |r| {
                r.size = size.unwrap_or(-1);
                r.mtime = mtime.unwrap_or(-1);
                r.got_date = if r.mtime == -1 { 0 } else { 1 };
            })?;
        }
        let record = list.get(index)?;
        if eligible(policy, &record_view(&record), now) {
            plan.files_to_retrieve += 1;
            if record.size > 0 {
                plan.size_to_retrieve += record.size as u64;
            }
            list.update(index, |r| r.assigned = request.job_no + 1)?;
        }
    }
    Ok(plan)
}

/// Full scan: list the remote side (or synthesize from the masks), diff
/// against the persisted entries, append what is new.
async fn full_scan<R: RemoteDir>(
    remote: &mut R,
    list: &mut RetrieveList,
    policy: &DirPolicy,
    masks: &[MaskGroup],
    request: PlanRequest,
    now: i64,
) -> Result<Plan, PlanError> {
    let mut plan = Plan::default();
    list.begin_scan()?;

    if policy.dont_get_dir_list {
        // No server contact: every mask, expanded against the clock, is
        // taken as a candidate name.
        let when = chrono::Utc::now();
        for group in masks {
            for mask in &group.masks {
                let candidate = namegen::expand_time_only(mask, when);
                check_candidate(
                    remote,
                    list,
                    policy,
                    request,
                    &mut plan,
                    &candidate,
                    None,
                    None,
                    false,
                    now,
                )
                .await?;
            }
        }
    } else {
        let body = remote.list().await?;
        for entry in listing::parse_listing(&body)? {
            if !check_name(&entry.name, policy.accept_dot_files, masks) {
                continue;
            }
            check_candidate(
                remote,
                list,
                policy,
                request,
                &mut plan,
                &entry.name,
                entry.mtime,
                entry.size,
                entry.size_exact,
                now,
            )
            .await?;
        }
    }

    // A persistent listing forgets what the remote side no longer has.
    if policy.stupid_mode == StupidMode::Persistent && !policy.remove {
        list.compact()?;
    }
    Ok(plan)
}

struct CandidateView {
    size: i64,
    mtime: i64,
    got_date: bool,
}

fn record_view(record: &crate::list::RetrieveRecord) -> CandidateView {
    CandidateView {
        size: record.size,
        mtime: record.mtime,
        got_date: record.got_date != 0,
    }
}

/// The size and age gates from the directory policy.
fn eligible(policy: &DirPolicy, candidate: &CandidateView, now: i64) -> bool {
    if !policy.size_sign.eligible(policy.ignore_size, candidate.size) {
        return false;
    }
    if !candidate.got_date || policy.ignore_file_time == 0 {
        return true;
    }
    policy
        .time_sign
        .eligible(policy.ignore_file_time, now - candidate.mtime)
}

/// Book an eligible candidate into the plan, honoring the caps.
fn book(plan: &mut Plan, caps: &Caps<'_>, size: i64, job_no: u8) -> u8 {
    plan.files_to_retrieve += 1;
    if size > 0 {
        plan.size_to_retrieve += size as u64;
    }
    if caps.within(plan) {
        job_no + 1
    } else {
        if size > 0 {
            plan.size_to_retrieve -= size as u64;
        }
        plan.more_files_in_list = true;
        0
    }
}

/// The diff of one listed candidate against the persisted list.
#[allow(clippy::too_many_arguments)]
async fn check_candidate<R: RemoteDir>(
    remote: &mut R,
    list: &mut RetrieveList,
    policy: &DirPolicy,
    request: PlanRequest,
    plan: &mut Plan,
    name: &str,
    listed_mtime: Option<i64>,
    listed_size: Option<i64>,
    size_exact: bool,
    now: i64,
) -> Result<(), PlanError> {
    let caps = Caps { policy };
    if name.len() >= MAX_FILENAME_LENGTH - 1 {
        warn!(
            "remote file name `{name}' is too long, it may only be {} bytes",
            MAX_FILENAME_LENGTH - 1
        );
        return Ok(());
    }

    if let Some(index) = list.find(name) {
        list.update(index, |r| r.in_list = 1)?;
        let record = list.get(index)?;

        if policy.stupid_mode == StupidMode::OneShot || policy.remove {
            // One-shot listings only re-offer what nobody picked up yet.
            if record.retrieved != 0 || record.assigned != 0 {
                return Ok(());
            }
            if request.old_error_job && list.try_lock_entry(index)?.is_none() {
                return Ok(());
            }
            let mut mtime = record.mtime;
            let mut size = record.size;
            if mtime == -1 && policy.ignore_file_time != 0 && !policy.dont_get_dir_list {
                let (head_size, head_mtime) = remote.head(name).await?;
                size = head_size.unwrap_or(size);
                mtime = head_mtime.unwrap_or(-1);
            }
            list.update(index, |r| {
                r.size = size;
                r.mtime = mtime;
                r.got_date = if mtime == -1 { 0 } else { 1 };
            })?;
            let record = list.get(index)?;
            if eligible(policy, &record_view(&record), now) {
                let assigned = book(plan, &caps, record.size, request.job_no);
                list.update(index, |r| r.assigned = assigned)?;
            }
            return Ok(());
        }

        // Persistent mode.
        if policy.stupid_mode == StupidMode::GetOnceOnly && record.retrieved != 0 {
            return Ok(());
        }
        if request.old_error_job && list.try_lock_entry(index)?.is_none() {
            return Ok(());
        }

        let mut mtime = listed_mtime;
        let mut size = listed_size;
        if !policy.dont_get_dir_list && (mtime.is_none() || size.is_none() || !size_exact) {
            match remote.head(name).await {
                Ok((head_size, head_mtime)) => {
                    size = head_size.or(size);
                    mtime = head_mtime.or(mtime);
                }
                Err(err) => {
                    debug!("failed to get date and size of file {name}: {err}");
                }
            }
        }

        list.update(index, |r| {
            match mtime {
                None => {
                    r.got_date = 0;
                    r.mtime = -1;
                    r.retrieved = 0;
                    r.assigned = 0;
                }
                Some(mtime) => {
                    r.got_date = 1;
                    if r.mtime != mtime {
                        r.mtime = mtime;
                        r.retrieved = 0;
                        r.assigned = 0;
                    }
                }
            }
            match size {
                None => {
                    r.size = -1;
                    r.retrieved = 0;
                    r.assigned = 0;
                }
                Some(size) => {
                    if r.size != size {
                        r.size = size;
                        r.retrieved = 0;
                        r.assigned = 0;
                    }
                }
            }
        })?;

        let record = list.get(index)?;
        if record.retrieved == 0 && eligible(policy, &record_view(&record), now) {
            let assigned = book(plan, &caps, record.size, request.job_no);
            list.update(index, |r| r.assigned = assigned)?;
        }
        return Ok(());
    }

    // A file the list has never seen.
    let mut mtime = listed_mtime;
    let mut size = listed_size;
    if !policy.dont_get_dir_list && (mtime.is_none() || size.is_none() || !size_exact) {
        match remote.head(name).await {
            Ok((head_size, head_mtime)) => {
                size = head_size.or(size);
                mtime = head_mtime.or(mtime);
            }
            Err(err) => {
                debug!("failed to get date and size of file {name}: {err}");
            }
        }
    }

    let candidate = CandidateView {
        size: size.unwrap_or(-1),
        mtime: mtime.unwrap_or(-1),
        got_date: mtime.is_some(),
    };
    if !eligible(policy, &candidate, now) {
        // Ineligible newcomers are not worth remembering.
        return Ok(());
    }

    let index = list.append(name)?;
    list.update(index, |r| {
        r.size = candidate.size;
        r.mtime = candidate.mtime;
        r.got_date = if candidate.got_date { 1 } else { 0 };
    })?;
    let assigned = book(plan, &caps, candidate.size, request.job_no);
    list.update(index, |r| r.assigned = assigned)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockRemote {
        body: Option<String>,
        heads: HashMap<String, (Option<i64>, Option<i64>)>,
        head_calls: Vec<String>,
    }

    impl MockRemote {
        fn with_body(body: &str) -> MockRemote {
            MockRemote {
                body: Some(body.to_string()),
                heads: HashMap::new(),
                head_calls: Vec::new(),
            }
        }

        fn offline() -> MockRemote {
            MockRemote {
                body: None,
                heads: HashMap::new(),
                head_calls: Vec::new(),
            }
        }
    }

    impl RemoteDir for MockRemote {
        async fn list(&mut self) -> Result<String, PlanError> {
            match &self.body {
                Some(body) => Ok(body.clone()),
                None => panic!("planner contacted the server"),
            }
        }

        async fn head(&mut self, name: &str) -> Result<(Option<i64>, Option<i64>), PlanError> {
            self.head_calls.push(name.to_string());
            Ok(self.heads.get(name).copied().unwrap_or((None, None)))
        }
    }

    fn policy() -> DirPolicy {
        DirPolicy {
            ignore_size: 0,
            size_sign: GtLtSign::Equal,
            ignore_file_time: 0,
            time_sign: GtLtSign::Equal,
            max_copied_files: 10,
            max_copied_file_size: u64::MAX,
            stupid_mode: StupidMode::Persistent,
            remove: false,
            dont_get_dir_list: false,
            accept_dot_files: false,
        }
    }

    fn request() -> PlanRequest {
        PlanRequest {
            more_files_in_list: false,
            distributed_helper: false,
            old_error_job: false,
            job_no: 0,
        }
    }

    fn match_all() -> Vec<MaskGroup> {
        vec![MaskGroup::new(vec!["*".into()])]
    }

    const CLASSIC_BODY: &str = "<h1>Index of /</h1><PRE><HR>\n\
        <a href=\"file.dat\">file.dat</a>   01-Jan-2020 12:00   5K\n\
        </PRE>";

    #[tokio::test]
    async fn test_full_scan_classic_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        // 5K is inexact, so the planner refines it over HEAD.
        remote
            .heads
            .insert("file.dat".into(), (Some(5 * 1024), Some(1_577_880_000)));

        let plan = plan_retrieval(&mut remote, &mut list, &policy(), &match_all(), request())
            .await
            .unwrap();

        assert_eq!(plan.files_to_retrieve, 1);
        assert_eq!(plan.size_to_retrieve, 5 * 1024);
        assert!(!plan.more_files_in_list);

        let index = list.find("file.dat").unwrap();
        let record = list.get(index).unwrap();
        assert_eq!(record.size, 5 * 1024);
        assert_eq!(record.mtime, 1_577_880_000);
        assert_eq!(record.assigned, 1);
        assert_eq!(record.retrieved, 0);
    }

    #[tokio::test]
    async fn test_mask_rejection_prevents_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        let masks = vec![MaskGroup::new(vec!["*.grib".into()])];

        let plan = plan_retrieval(&mut remote, &mut list, &policy(), &masks, request())
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 0);
        assert!(remote.head_calls.is_empty());
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_zero_file_cap_assigns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        remote
            .heads
            .insert("file.dat".into(), (Some(5 * 1024), Some(1_577_880_000)));
        let mut policy = policy();
        policy.max_copied_files = 0;

        let plan = plan_retrieval(&mut remote, &mut list, &policy, &match_all(), request())
            .await
            .unwrap();
        assert!(plan.more_files_in_list);
        let index = list.find("file.dat").unwrap();
        assert_eq!(list.get(index).unwrap().assigned, 0);
    }

    #[tokio::test]
    async fn test_dont_get_dir_list_never_contacts_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let mut remote = MockRemote::offline();
        let mut policy = policy();
        policy.dont_get_dir_list = true;
        let masks = vec![MaskGroup::new(vec!["obs_fixed_name".into()])];

        let plan = plan_retrieval(&mut remote, &mut list, &policy, &masks, request())
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 1);
        assert!(list.find("obs_fixed_name").is_some());
        assert!(remote.head_calls.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_mode_refetches_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let index = list.append("file.dat").unwrap();
        list.update(index, |r| {
            r.size = 4 * 1024;
            r.mtime = 1_000_000_000;
            r.got_date = 1;
            r.retrieved = 1;
        })
        .unwrap();

        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        remote
            .heads
            .insert("file.dat".into(), (Some(5 * 1024), Some(1_577_880_000)));

        let plan = plan_retrieval(&mut remote, &mut list, &policy(), &match_all(), request())
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 1);
        let record = list.get(index).unwrap();
        assert_eq!(record.retrieved, 0);
        assert_eq!(record.size, 5 * 1024);
        assert_eq!(record.assigned, 1);
    }

    #[tokio::test]
    async fn test_get_once_only_skips_retrieved() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let index = list.append("file.dat").unwrap();
        list.update(index, |r| {
            r.size = 5 * 1024;
            r.mtime = 1_577_880_000;
            r.got_date = 1;
            r.retrieved = 1;
        })
        .unwrap();

        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        let mut policy = policy();
        policy.stupid_mode = StupidMode::GetOnceOnly;

        let plan = plan_retrieval(&mut remote, &mut list, &policy, &match_all(), request())
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 0);
        assert_eq!(list.get(index).unwrap().retrieved, 1);
    }

    #[tokio::test]
    async fn test_compaction_drops_vanished_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let stale = list.append("gone.dat").unwrap();
        list.update(stale, |r| r.retrieved = 1).unwrap();

        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        remote
            .heads
            .insert("file.dat".into(), (Some(5 * 1024), Some(1_577_880_000)));

        plan_retrieval(&mut remote, &mut list, &policy(), &match_all(), request())
            .await
            .unwrap();
        assert!(list.find("gone.dat").is_none());
        assert!(list.find("file.dat").is_some());
    }

    #[tokio::test]
    async fn test_resume_path_skips_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        for i in 0..3 {
            let index = list.append(&format!("pending{i}")).unwrap();
            list.update(index, |r| {
                r.size = 100;
                r.mtime = 1_577_880_000;
                r.got_date = 1;
            })
            .unwrap();
        }

        let mut remote = MockRemote::offline();
        let mut request = request();
        request.more_files_in_list = true;

        let plan = plan_retrieval(&mut remote, &mut list, &policy(), &match_all(), request)
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 3);
        assert_eq!(plan.size_to_retrieve, 300);
        for index in list.occupied() {
            assert_eq!(list.get(index).unwrap().assigned, 1);
        }
    }

    #[tokio::test]
    async fn test_resume_respects_file_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        for i in 0..5 {
            let index = list.append(&format!("pending{i}")).unwrap();
            list.update(index, |r| {
                r.size = 100;
                r.mtime = 1_577_880_000;
                r.got_date = 1;
            })
            .unwrap();
        }

        let mut remote = MockRemote::offline();
        let mut policy = policy();
        policy.max_copied_files = 2;
        let mut request = request();
        request.distributed_helper = true;

        let plan = plan_retrieval(&mut remote, &mut list, &policy, &match_all(), request)
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 2);
        assert!(plan.more_files_in_list);
        let assigned = list
            .occupied()
            .iter()
            .filter(|&&i| list.get(i).unwrap().assigned != 0)
            .count();
        assert_eq!(assigned, 2);
    }

    #[tokio::test]
    async fn test_ignore_size_relation() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("ls")).unwrap();
        let mut remote = MockRemote::with_body(CLASSIC_BODY);
        remote
            .heads
            .insert("file.dat".into(), (Some(5 * 1024), Some(1_577_880_000)));
        // Only files larger than 8K are eligible; 5K is not.
        let mut policy = policy();
        policy.ignore_size = 8 * 1024;
        policy.size_sign = GtLtSign::LessThan;

        let plan = plan_retrieval(&mut remote, &mut list, &policy, &match_all(), request())
            .await
            .unwrap();
        assert_eq!(plan.files_to_retrieve, 0);
        // The ineligible newcomer is not persisted either.
        assert!(list.is_empty());
    }
}
