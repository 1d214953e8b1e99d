//! The resolve merger: a synchronized walk over BASE, OURS, THEIRS, the
//! dircache, and the working tree, with a per-path decision machine.
//!
//! Trivial resolutions reuse one side's entry; diverging file content goes
//! through the line-level content merge; everything else is staged as a
//! conflict. A dircache or working tree that diverges from OURS aborts the
//! merge (a failure, not a conflict) and rolls back any files already
//! touched.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice};
use tracing::{debug, trace};

use arbor_diff::DiffAlgorithm;
use arbor_hash::ObjectId;
use arbor_index::{DirCache, DirCacheBuilder, IndexEntry, Stage, StatData};
use arbor_object::{FileMode, ObjectType};
use arbor_odb::ObjectStore;
use arbor_repository::Repository;

use crate::content::{merge_content, MergeLabels};
use crate::walk::{index_level, non_tree, tree_level, IndexGroup, TreeNode};
use crate::worktree::{path_from_bytes, WorkNode, WorkingTreeIterator};
use crate::{
    default_commit_names, ConflictStyle, ContentMergeResult, FailureReason, FilterChoice,
    MergeError, MergeFilter,
};

/// One position of the synchronized walk.
struct WalkEntry<'a> {
    /// Full repository-relative path.
    path: BString,
    base: Option<&'a TreeNode>,
    ours: Option<&'a TreeNode>,
    theirs: Option<&'a TreeNode>,
    /// First (lowest-stage) dircache entry at exactly this path.
    index_file: Option<&'a IndexEntry>,
    work: Option<&'a WorkNode>,
    /// Any source holds a directory at this name.
    is_subtree: bool,
}

/// Outcome of the clean-worktree gate.
enum Rescue {
    /// Worktree is clean; proceed with the normal action.
    Clean,
    /// The path was dirty but the merge filter resolved it.
    Resolved,
    /// Dirty and no filter; the merge aborts.
    Abort,
}

/// Where a merged file was written.
enum MergedFile {
    /// Inside the working tree.
    WorkTree(PathBuf),
    /// A temporary file (in-core merge); deleted after its bytes are
    /// inserted into the object store.
    Temp(PathBuf),
}

impl MergedFile {
    fn path(&self) -> &Path {
        match self {
            Self::WorkTree(p) | Self::Temp(p) => p,
        }
    }
}

/// Three-way tree merger with dircache and working-tree integration.
pub struct ResolveMerger<'repo> {
    repo: &'repo Repository,
    in_core: bool,

    dircache: Option<DirCache>,
    worktree: Option<WorkingTreeIterator>,
    commit_names: [String; 3],
    merge_filter: Option<MergeFilter>,
    diff_algorithm: DiffAlgorithm,
    conflict_style: ConflictStyle,

    to_be_checked_out: BTreeMap<BString, IndexEntry>,
    to_be_deleted: Vec<BString>,
    modified_files: Vec<BString>,
    unmerged_paths: Vec<BString>,
    merge_results: BTreeMap<BString, ContentMergeResult>,
    failing_paths: BTreeMap<BString, FailureReason>,
    enter_subtree: bool,
    result_tree: Option<ObjectId>,
}

impl<'repo> ResolveMerger<'repo> {
    /// Create a merger for `repo`.
    ///
    /// With `in_core` set, no working tree is touched and only conflict-free
    /// content merges produce blobs. The diff algorithm and conflict style
    /// are read from the repository config once, here.
    pub fn new(repo: &'repo Repository, in_core: bool) -> Self {
        let diff_algorithm = repo
            .config()
            .get_string("diff.algorithm")
            .ok()
            .flatten()
            .and_then(|name| DiffAlgorithm::from_name(&name))
            .unwrap_or_default();
        let conflict_style = repo
            .config()
            .get_string("merge.conflictstyle")
            .ok()
            .flatten()
            .and_then(|name| ConflictStyle::from_name(&name))
            .unwrap_or_default();

        Self {
            repo,
            in_core,
            dircache: None,
            worktree: None,
            commit_names: default_commit_names(),
            merge_filter: None,
            diff_algorithm,
            conflict_style,
            to_be_checked_out: BTreeMap::new(),
            to_be_deleted: Vec::new(),
            modified_files: Vec::new(),
            unmerged_paths: Vec::new(),
            merge_results: BTreeMap::new(),
            failing_paths: BTreeMap::new(),
            enter_subtree: true,
            result_tree: None,
        }
    }

    /// Supply a dircache. Without one, the merger locks the repository's
    /// own dircache for the duration of the merge (and releases the lock on
    /// every exit path). A caller-supplied dircache stays the caller's
    /// responsibility on exceptional paths.
    pub fn set_dir_cache(&mut self, dircache: DirCache) {
        self.dircache = Some(dircache);
    }

    /// Supply the working-tree iterator used for dirty checking and the
    /// `T_FILE` walk slot. Absent, the working tree is treated as clean.
    pub fn set_working_tree_iterator(&mut self, iter: Option<WorkingTreeIterator>) {
        self.worktree = iter;
    }

    /// Names written into conflict markers, as `[base, ours, theirs]`.
    pub fn set_commit_names(&mut self, names: [String; 3]) {
        self.commit_names = names;
    }

    /// Install an automatic conflict resolver.
    pub fn set_merge_filter(&mut self, filter: impl FnMut(&BStr) -> FilterChoice + 'static) {
        self.merge_filter = Some(Box::new(filter));
    }

    /// Merge the trees `base`, `ours`, and `theirs`.
    ///
    /// Returns `Ok(true)` on a clean merge (the result tree has been
    /// written), `Ok(false)` on conflicts or failing paths, and `Err` on
    /// fatal I/O or store errors.
    pub fn merge(
        &mut self,
        base: &ObjectId,
        ours: &ObjectId,
        theirs: &ObjectId,
    ) -> Result<bool, MergeError> {
        let span = tracing::debug_span!("merge", base = %base, ours = %ours, theirs = %theirs);
        let _guard = span.enter();

        let implicit = self.dircache.is_none();
        let mut dc = match self.dircache.take() {
            Some(dc) => dc,
            None if self.in_core => DirCache::new_in_core(),
            None => DirCache::lock(self.repo.index_path())?,
        };

        let outcome = self.merge_impl(&mut dc, base, ours, theirs);

        // Guaranteed-release scope for the implicitly acquired lock; a
        // successful commit has already consumed it.
        if implicit && dc.is_locked() {
            let _ = dc.unlock();
        }
        self.dircache = Some(dc);

        outcome
    }

    fn merge_impl(
        &mut self,
        dc: &mut DirCache,
        base: &ObjectId,
        ours: &ObjectId,
        theirs: &ObjectId,
    ) -> Result<bool, MergeError> {
        let store = self.repo.odb();
        let base_nodes = tree_level(store, Some(base))?;
        let ours_nodes = tree_level(store, Some(ours))?;
        let theirs_nodes = tree_level(store, Some(theirs))?;

        let old_entries: Vec<IndexEntry> = dc.entries().to_vec();
        let index_range = (0, old_entries.len());
        let mut builder = dc.builder();

        let ok = match self.merge_level(
            &mut builder,
            &base_nodes,
            &ours_nodes,
            &theirs_nodes,
            &old_entries,
            index_range,
            &BString::from(""),
        ) {
            Ok(ok) => ok,
            Err(e) => {
                drop(builder);
                let _ = self.clean_up();
                return Err(e);
            }
        };

        if !ok {
            debug!(failing = self.failing_paths.len(), "merge aborted; rolling back");
            drop(builder);
            self.clean_up()?;
            return Ok(false);
        }

        if !self.in_core {
            if let Err(e) = self.checkout(&mut builder) {
                drop(builder);
                let _ = self.clean_up();
                return Err(e);
            }
            if let Err(e) = builder.commit() {
                self.clean_up()?;
                return Err(e.into());
            }
        } else {
            builder.finish();
        }

        if self.unmerged_paths.is_empty() && !self.failed() {
            self.result_tree = Some(dc.write_tree(self.repo.odb())?);
            Ok(true)
        } else {
            self.result_tree = None;
            Ok(false)
        }
    }

    /// Walk one directory level across the five sources.
    fn merge_level(
        &mut self,
        builder: &mut DirCacheBuilder<'_>,
        base_nodes: &[TreeNode],
        ours_nodes: &[TreeNode],
        theirs_nodes: &[TreeNode],
        index_entries: &[IndexEntry],
        index_range: (usize, usize),
        prefix: &BString,
    ) -> Result<bool, MergeError> {
        #[derive(Default)]
        struct Position<'a> {
            base: Option<&'a TreeNode>,
            ours: Option<&'a TreeNode>,
            theirs: Option<&'a TreeNode>,
            index: Option<IndexGroup>,
            work: Option<&'a WorkNode>,
        }

        let index_groups = index_level(index_entries, index_range, prefix.len());
        let work_nodes = match &self.worktree {
            Some(iter) if !self.in_core => {
                let wt_prefix = if prefix.is_empty() {
                    BStr::new("")
                } else {
                    prefix[..prefix.len() - 1].as_bstr()
                };
                iter.level(wt_prefix)?
            }
            _ => Vec::new(),
        };

        // Union the level's names. A file in one source and a directory of
        // the same name in another share one position.
        let mut positions: BTreeMap<&BStr, Position<'_>> = BTreeMap::new();
        for n in base_nodes {
            positions.entry(n.name.as_bstr()).or_default().base = Some(n);
        }
        for n in ours_nodes {
            positions.entry(n.name.as_bstr()).or_default().ours = Some(n);
        }
        for n in theirs_nodes {
            positions.entry(n.name.as_bstr()).or_default().theirs = Some(n);
        }
        for (name, group) in &index_groups {
            positions.entry(name.as_bstr()).or_default().index = Some(*group);
        }
        for w in &work_nodes {
            positions.entry(w.name.as_bstr()).or_default().work = Some(w);
        }

        for (name, pos) in &positions {
            let mut path = prefix.clone();
            path.extend_from_slice(name.as_bytes());

            let is_subtree = pos.base.map_or(false, |n| n.mode.is_tree())
                || pos.ours.map_or(false, |n| n.mode.is_tree())
                || pos.theirs.map_or(false, |n| n.mode.is_tree())
                || pos.index.is_some_and(|g| g.dir_range.is_some())
                || pos.work.map_or(false, |w| w.mode.is_tree());

            let entry = WalkEntry {
                path: path.clone(),
                base: pos.base,
                ours: pos.ours,
                theirs: pos.theirs,
                index_file: pos
                    .index
                    .and_then(|g| g.file_range)
                    .map(|(lo, _)| &index_entries[lo]),
                work: pos.work,
                is_subtree,
            };

            if !self.process_entry(builder, &entry)? {
                return Ok(false);
            }

            if is_subtree && self.enter_subtree {
                path.push(b'/');
                let store = self.repo.odb();
                let b_children = child_nodes(store, pos.base)?;
                let o_children = child_nodes(store, pos.ours)?;
                let t_children = child_nodes(store, pos.theirs)?;
                let child_range = pos.index.and_then(|g| g.dir_range).unwrap_or((0, 0));

                if !self.merge_level(
                    builder,
                    &b_children,
                    &o_children,
                    &t_children,
                    index_entries,
                    child_range,
                    &path,
                )? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Decide one path. Returns `false` to abort the whole merge.
    fn process_entry(
        &mut self,
        builder: &mut DirCacheBuilder<'_>,
        e: &WalkEntry<'_>,
    ) -> Result<bool, MergeError> {
        self.enter_subtree = true;

        let mode_b = TreeNode::raw_mode(e.base);
        let mode_o = TreeNode::raw_mode(e.ours);
        let mode_t = TreeNode::raw_mode(e.theirs);

        // Absent from all three trees: untracked, staged but uncommitted,
        // or a phantom produced by name-conflict alignment.
        if mode_b == 0 && mode_o == 0 && mode_t == 0 {
            return Ok(true);
        }

        if self.index_dirty(e) {
            return Ok(false);
        }

        let our_dce: Option<IndexEntry> = match (e.index_file, e.ours) {
            (Some(ix), _) => Some(ix.clone()),
            (None, Some(ours)) if non_tree(mode_o) => Some(IndexEntry::new(
                e.path.clone(),
                ours.oid,
                ours.mode,
                Stage::Normal,
            )),
            _ => None,
        };

        let oid_b = TreeNode::oid_of(e.base);
        let oid_o = TreeNode::oid_of(e.ours);
        let oid_t = TreeNode::oid_of(e.theirs);

        // Both sides hold the same content.
        if non_tree(mode_o) && non_tree(mode_t) && oid_o == oid_t {
            if mode_o == mode_t {
                if let Some(dce) = &our_dce {
                    builder.keep(dce);
                }
                return Ok(true);
            }

            // Same content, different modes.
            let new_mode = merge_modes(mode_b, mode_o, mode_t);
            if new_mode != 0 {
                if new_mode == mode_o {
                    if let Some(dce) = &our_dce {
                        builder.keep(dce);
                    }
                } else {
                    // The merged mode comes from theirs.
                    match self.clean_worktree_gate(builder, e, &our_dce)? {
                        Rescue::Abort => return Ok(false),
                        Rescue::Resolved => return Ok(true),
                        Rescue::Clean => {
                            if let Some(ent) =
                                add_slot(builder, e.path.as_ref(), e.theirs, Stage::Normal)
                            {
                                self.to_be_checked_out.insert(e.path.clone(), ent);
                            }
                        }
                    }
                }
            } else {
                // Modes cannot be merged.
                match self.filter_choice(e.path.as_ref()) {
                    Some(FilterChoice::Ours) => {
                        if let Some(dce) = &our_dce {
                            builder.keep(dce);
                        }
                    }
                    Some(FilterChoice::Theirs) => {
                        if let Some(ent) = add_slot(builder, e.path.as_ref(), e.theirs, Stage::Normal) {
                            self.to_be_checked_out.insert(e.path.clone(), ent);
                        }
                    }
                    None => {
                        add_slot(builder, e.path.as_ref(), e.base, Stage::Base);
                        add_slot(builder, e.path.as_ref(), e.ours, Stage::Ours);
                        add_slot(builder, e.path.as_ref(), e.theirs, Stage::Theirs);
                        self.unmerged_paths.push(e.path.clone());
                        // Consumers expect the key to be present even though
                        // there is nothing to render for a mode conflict.
                        self.merge_results
                            .insert(e.path.clone(), ContentMergeResult::empty());
                    }
                }
            }
            return Ok(true);
        }

        // THEIRS matches BASE: all changes are ours.
        if non_tree(mode_o) && mode_b == mode_t && oid_b == oid_t {
            if let Some(dce) = &our_dce {
                builder.keep(dce);
            }
            return Ok(true);
        }

        // OURS matches BASE: take theirs.
        if mode_b == mode_o && oid_b == oid_o {
            match self.clean_worktree_gate(builder, e, &our_dce)? {
                Rescue::Abort => return Ok(false),
                Rescue::Resolved => return Ok(true),
                Rescue::Clean => {}
            }
            if non_tree(mode_t) {
                if let Some(ent) = add_slot(builder, e.path.as_ref(), e.theirs, Stage::Normal) {
                    self.to_be_checked_out.insert(e.path.clone(), ent);
                }
            } else if mode_t == 0 && mode_b != 0 {
                // Deleted on their side.
                self.to_be_deleted.push(e.path.clone());
            }
            return Ok(true);
        }

        // File/directory clash between ours and theirs. Clashes against
        // base, dircache, or working tree are either irrelevant or caught
        // by the later cases.
        if e.is_subtree {
            if non_tree(mode_o) && !non_tree(mode_t) {
                if non_tree(mode_b) {
                    add_slot(builder, e.path.as_ref(), e.base, Stage::Base);
                }
                add_slot(builder, e.path.as_ref(), e.ours, Stage::Ours);
                self.unmerged_paths.push(e.path.clone());
                self.enter_subtree = false;
                return Ok(true);
            }
            if non_tree(mode_t) && !non_tree(mode_o) {
                if non_tree(mode_b) {
                    add_slot(builder, e.path.as_ref(), e.base, Stage::Base);
                }
                add_slot(builder, e.path.as_ref(), e.theirs, Stage::Theirs);
                self.unmerged_paths.push(e.path.clone());
                self.enter_subtree = false;
                return Ok(true);
            }
            if !non_tree(mode_o) {
                // Trees (or absences) on both sides: descend.
                return Ok(true);
            }
            // Files on both sides despite the subtree flag: merge content.
        }

        // Files on both sides with differing content.
        if non_tree(mode_o) && non_tree(mode_t) {
            match self.clean_worktree_gate(builder, e, &our_dce)? {
                Rescue::Abort => return Ok(false),
                Rescue::Resolved => return Ok(true),
                Rescue::Clean => {}
            }

            // Nested-repository links cannot be content-merged.
            if FileMode::from_raw(mode_o).is_gitlink() || FileMode::from_raw(mode_t).is_gitlink()
            {
                add_slot(builder, e.path.as_ref(), e.base, Stage::Base);
                add_slot(builder, e.path.as_ref(), e.ours, Stage::Ours);
                add_slot(builder, e.path.as_ref(), e.theirs, Stage::Theirs);
                self.unmerged_paths.push(e.path.clone());
                return Ok(true);
            }

            let result = self.content_merge(e)?;
            let had_conflict = result.has_conflicts();

            if had_conflict {
                if let Some(choice) = self.filter_choice(e.path.as_ref()) {
                    trace!(path = %e.path, ?choice, "conflict resolved by filter");
                    match choice {
                        FilterChoice::Ours => {
                            if let Some(dce) = &our_dce {
                                builder.keep(dce);
                            }
                        }
                        FilterChoice::Theirs => {
                            if let Some(ent) = add_slot(builder, e.path.as_ref(), e.theirs, Stage::Normal)
                            {
                                self.to_be_checked_out.insert(e.path.clone(), ent);
                            }
                        }
                    }
                    return Ok(true);
                }
            }

            let of = self.write_merged_file(e.path.as_ref(), &result)?;
            self.update_index(builder, e, result, of)?;
            if had_conflict {
                self.unmerged_paths.push(e.path.clone());
            }
            self.modified_files.push(e.path.clone());
            return Ok(true);
        }

        // One side deleted what the other may have modified.
        if mode_o != mode_t {
            let modified = (mode_o != 0 && oid_b != oid_o) || (mode_t != 0 && oid_b != oid_t);
            if modified {
                // Ours deleted the file, so theirs' content will land in
                // the working tree: it must be clean first, with the same
                // filter rescue as every other theirs-taking site.
                if mode_o == 0 {
                    match self.clean_worktree_gate(builder, e, &our_dce)? {
                        Rescue::Abort => return Ok(false),
                        Rescue::Resolved => return Ok(true),
                        Rescue::Clean => {}
                    }
                }

                add_slot(builder, e.path.as_ref(), e.base, Stage::Base);
                add_slot(builder, e.path.as_ref(), e.ours, Stage::Ours);
                add_slot(builder, e.path.as_ref(), e.theirs, Stage::Theirs);

                if mode_o == 0 && non_tree(mode_t) {
                    if let Some(theirs) = e.theirs {
                        // The checkout schedule carries merged-stage
                        // entries only; theirs' rendering of the conflict
                        // goes in as a stage-0 copy.
                        self.to_be_checked_out.insert(
                            e.path.clone(),
                            IndexEntry::new(
                                e.path.clone(),
                                theirs.oid,
                                theirs.mode,
                                Stage::Normal,
                            ),
                        );
                    }
                }

                self.unmerged_paths.push(e.path.clone());
                let result = self.content_merge(e)?;
                self.merge_results.insert(e.path.clone(), result);
            }
            // Else: one side deleted, the other left the file untouched.
            // Nothing enters the builder and the path vanishes cleanly.
            return Ok(true);
        }

        Ok(true)
    }

    /// The dirty-index check. Records the failure when dirty.
    fn index_dirty(&mut self, e: &WalkEntry<'_>) -> bool {
        if self.in_core {
            return false;
        }
        let mode_o = TreeNode::raw_mode(e.ours);
        let dirty = match e.index_file {
            Some(ix) if non_tree(ix.mode.raw()) => {
                !(ix.mode.raw() == mode_o && ix.oid == TreeNode::oid_of(e.ours))
            }
            _ => false,
        };
        if dirty {
            trace!(path = %e.path, "dircache diverges from ours");
            self.failing_paths
                .insert(e.path.clone(), FailureReason::DirtyIndex);
        }
        dirty
    }

    /// The dirty-worktree predicate. Does not record; recording happens at
    /// the single point where no filter can rescue the path.
    fn worktree_dirty(&self, e: &WalkEntry<'_>) -> Result<bool, MergeError> {
        if self.in_core {
            return Ok(false);
        }
        let Some(work_iter) = &self.worktree else {
            return Ok(false);
        };
        let Some(work) = e.work else {
            return Ok(false);
        };

        let mode_o = TreeNode::raw_mode(e.ours);

        if WorkingTreeIterator::mode_differs(work, mode_o) {
            return Ok(true);
        }
        if non_tree(work.mode.raw()) {
            let work_oid = work_iter.content_oid(work, e.index_file)?;
            return Ok(work_oid != TreeNode::oid_of(e.ours));
        }
        Ok(false)
    }

    /// Gate used where the working tree must be clean before taking theirs:
    /// on a dirty path, the merge filter may still resolve the conflict;
    /// without one the path is recorded as failing.
    fn clean_worktree_gate(
        &mut self,
        builder: &mut DirCacheBuilder<'_>,
        e: &WalkEntry<'_>,
        our_dce: &Option<IndexEntry>,
    ) -> Result<Rescue, MergeError> {
        if !self.worktree_dirty(e)? {
            return Ok(Rescue::Clean);
        }
        match self.filter_choice(e.path.as_ref()) {
            Some(FilterChoice::Ours) => {
                if let Some(dce) = our_dce {
                    builder.keep(dce);
                }
                Ok(Rescue::Resolved)
            }
            Some(FilterChoice::Theirs) => {
                if let Some(ent) = add_slot(builder, e.path.as_ref(), e.theirs, Stage::Normal) {
                    self.to_be_checked_out.insert(e.path.clone(), ent);
                }
                Ok(Rescue::Resolved)
            }
            None => {
                trace!(path = %e.path, "working tree diverges from ours");
                self.failing_paths
                    .insert(e.path.clone(), FailureReason::DirtyWorktree);
                Ok(Rescue::Abort)
            }
        }
    }

    fn filter_choice(&mut self, path: &BStr) -> Option<FilterChoice> {
        self.merge_filter.as_mut().map(|f| f(path))
    }

    /// Load a slot's blob bytes; absent and non-file slots read as empty.
    fn raw_text(&self, slot: Option<&TreeNode>) -> Result<Vec<u8>, MergeError> {
        match slot {
            Some(n) if non_tree(n.mode.raw()) && !n.oid.is_null() => {
                Ok(self.repo.odb().read_blob(&n.oid)?)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Run the line-level merge over the three slots.
    fn content_merge(&self, e: &WalkEntry<'_>) -> Result<ContentMergeResult, MergeError> {
        let base = self.raw_text(e.base)?;
        let ours = self.raw_text(e.ours)?;
        let theirs = self.raw_text(e.theirs)?;
        let labels = MergeLabels {
            base: &self.commit_names[0],
            ours: &self.commit_names[1],
            theirs: &self.commit_names[2],
        };
        Ok(merge_content(
            &base,
            &ours,
            &theirs,
            self.diff_algorithm,
            self.conflict_style,
            &labels,
        ))
    }

    /// Write the formatted merge result.
    ///
    /// Outside in-core mode it lands in the working tree (conflict markers
    /// included). In-core, conflict-free content goes to a temporary file
    /// whose bytes the caller hashes into the object store; conflicted
    /// content is not written at all.
    fn write_merged_file(
        &mut self,
        path: &BStr,
        result: &ContentMergeResult,
    ) -> Result<Option<MergedFile>, MergeError> {
        if !self.in_core {
            let root = self.repo.work_tree().ok_or(MergeError::NoWorkTree)?;
            let target = root.join(path_from_bytes(path));
            if let Some(parent) = target.parent() {
                create_dir(parent)?;
            }
            fs::write(&target, result.content())?;
            Ok(Some(MergedFile::WorkTree(target)))
        } else if !result.has_conflicts() {
            let mut tmp = arbor_utils::tempfile::TempFile::new_in(self.repo.git_dir())
                .map_err(io_from_util)?;
            tmp.write_all(result.content())?;
            let kept = tmp.keep().map_err(io_from_util)?;
            Ok(Some(MergedFile::Temp(kept)))
        } else {
            Ok(None)
        }
    }

    /// Record a content-merge outcome in the builder: conflict stages for a
    /// conflicted result, a fresh stage-0 entry (blob inserted into the
    /// store, stat taken from the written file) otherwise.
    fn update_index(
        &mut self,
        builder: &mut DirCacheBuilder<'_>,
        e: &WalkEntry<'_>,
        result: ContentMergeResult,
        of: Option<MergedFile>,
    ) -> Result<(), MergeError> {
        if result.has_conflicts() {
            add_slot(builder, e.path.as_ref(), e.base, Stage::Base);
            add_slot(builder, e.path.as_ref(), e.ours, Stage::Ours);
            add_slot(builder, e.path.as_ref(), e.theirs, Stage::Theirs);
            self.merge_results.insert(e.path.clone(), result);
            return Ok(());
        }

        let merged_mode = merge_modes(
            TreeNode::raw_mode(e.base),
            TreeNode::raw_mode(e.ours),
            TreeNode::raw_mode(e.theirs),
        );
        let mode = if merged_mode == 0 {
            FileMode::Regular
        } else {
            FileMode::from_raw(merged_mode)
        };

        let mut entry = IndexEntry::new(e.path.clone(), ObjectId::NULL_SHA1, mode, Stage::Normal);

        match of {
            Some(of) => {
                let meta = fs::metadata(of.path())?;
                entry.stat = StatData::from_metadata(&meta);
                let data = fs::read(of.path())?;
                entry.oid = self.repo.odb().write_raw(ObjectType::Blob, &data)?;
                if let MergedFile::Temp(path) = of {
                    fs::remove_file(path)?;
                }
            }
            None => {
                entry.oid = self
                    .repo
                    .odb()
                    .write_raw(ObjectType::Blob, result.content())?;
            }
        }

        builder.add(entry.clone());
        if !self.in_core {
            self.to_be_checked_out.insert(e.path.clone(), entry);
        }
        Ok(())
    }

    /// Materialize pending checkouts, then replay deletions in reverse
    /// order so files go before their directories.
    fn checkout(&mut self, builder: &mut DirCacheBuilder<'_>) -> Result<(), MergeError> {
        let root = self
            .repo
            .work_tree()
            .ok_or(MergeError::NoWorkTree)?
            .to_path_buf();
        let store = self.repo.odb();

        let pending: Vec<(BString, IndexEntry)> = self
            .to_be_checked_out
            .iter()
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        debug!(
            checkouts = pending.len(),
            deletions = self.to_be_deleted.len(),
            "updating working tree"
        );
        for (path, entry) in pending {
            let stat = checkout_entry(&root, store, path.as_bstr(), &entry)?;
            builder.refresh_stat(path.as_bstr(), stat);
            if !self.modified_files.contains(&path) {
                self.modified_files.push(path);
            }
        }

        let deletions: Vec<BString> = self.to_be_deleted.iter().rev().cloned().collect();
        for path in deletions {
            let target = root.join(path_from_bytes(path.as_bstr()));
            let removed = match target.symlink_metadata() {
                Err(_) => true, // already gone
                Ok(meta) if meta.is_dir() => fs::remove_dir(&target).is_ok(),
                Ok(_) => fs::remove_file(&target).is_ok(),
            };
            if !removed {
                self.failing_paths
                    .insert(path.clone(), FailureReason::CouldNotDelete);
            }
            if !self.modified_files.contains(&path) {
                self.modified_files.push(path);
            }
        }

        Ok(())
    }

    /// Roll the working tree back: every touched path is overwritten from
    /// the stage-0 entry of the dircache currently on disk. In-core merges
    /// only forget what they touched.
    fn clean_up(&mut self) -> Result<(), MergeError> {
        if self.in_core {
            self.modified_files.clear();
            return Ok(());
        }
        let Some(root) = self.repo.work_tree().map(Path::to_path_buf) else {
            self.modified_files.clear();
            return Ok(());
        };

        debug!(files = self.modified_files.len(), "restoring working tree");
        let dc = DirCache::read_from(self.repo.index_path())?;
        let store = self.repo.odb();
        for path in std::mem::take(&mut self.modified_files) {
            if let Some(entry) = dc.entry(path.as_bstr(), Stage::Normal) {
                checkout_entry(&root, store, path.as_bstr(), entry)?;
            }
        }
        Ok(())
    }

    // --- Observable results ---

    /// OID of the written result tree, when the merge succeeded.
    pub fn result_tree_id(&self) -> Option<ObjectId> {
        self.result_tree
    }

    /// Paths recorded with conflict stages, in walk order.
    pub fn unmerged_paths(&self) -> &[BString] {
        &self.unmerged_paths
    }

    /// Working-tree paths this merge touched, in insertion order.
    pub fn modified_files(&self) -> &[BString] {
        &self.modified_files
    }

    /// Entries scheduled for checkout.
    pub fn to_be_checked_out(&self) -> &BTreeMap<BString, IndexEntry> {
        &self.to_be_checked_out
    }

    /// Content-merge results for conflicted and deletion-conflicted paths.
    pub fn merge_results(&self) -> &BTreeMap<BString, ContentMergeResult> {
        &self.merge_results
    }

    /// Paths that caused the merge to be aborted, with their reasons.
    pub fn failing_paths(&self) -> &BTreeMap<BString, FailureReason> {
        &self.failing_paths
    }

    /// Whether the merge failed (aborted), as opposed to conflicted.
    pub fn failed(&self) -> bool {
        !self.failing_paths.is_empty()
    }

    /// The dircache the merge operated on. After an in-core merge this
    /// holds the merged entries.
    pub fn dir_cache(&self) -> Option<&DirCache> {
        self.dircache.as_ref()
    }
}

/// Merge three file modes; 0 signals an unmergeable mode conflict.
pub(crate) fn merge_modes(mode_b: u32, mode_o: u32, mode_t: u32) -> u32 {
    if mode_o == mode_t {
        mode_o
    } else if mode_b == mode_o {
        // Ours didn't change the mode; theirs wins unless it vanished.
        if mode_t == 0 {
            mode_o
        } else {
            mode_t
        }
    } else if mode_b == mode_t {
        if mode_o == 0 {
            mode_t
        } else {
            mode_o
        }
    } else {
        0
    }
}

/// Append a stage entry copied from a walk slot. No-op (returning `None`)
/// for absent slots and trees.
fn add_slot(
    builder: &mut DirCacheBuilder<'_>,
    path: &BStr,
    slot: Option<&TreeNode>,
    stage: Stage,
) -> Option<IndexEntry> {
    match slot {
        Some(n) if !n.mode.is_tree() => {
            let entry = IndexEntry::new(BString::from(path), n.oid, n.mode, stage);
            builder.add(entry.clone());
            Some(entry)
        }
        _ => None,
    }
}

/// Level entries below a tree slot; empty for files and absences.
fn child_nodes(
    store: &ObjectStore,
    slot: Option<&TreeNode>,
) -> Result<Vec<TreeNode>, MergeError> {
    match slot {
        Some(n) if n.mode.is_tree() => tree_level(store, Some(&n.oid)),
        _ => Ok(Vec::new()),
    }
}

/// Create a directory chain, removing a blocking non-directory if one sits
/// where a directory must go.
fn create_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(first) => {
            let mut probe = Some(dir);
            while let Some(p) = probe {
                if p.symlink_metadata().is_ok() {
                    if p.is_dir() {
                        return Err(first);
                    }
                    fs::remove_file(p)?;
                    return fs::create_dir_all(dir);
                }
                probe = p.parent();
            }
            Err(first)
        }
    }
}

/// Write one entry's blob into the working tree and report the resulting
/// stat data.
fn checkout_entry(
    root: &Path,
    store: &ObjectStore,
    path: &BStr,
    entry: &IndexEntry,
) -> Result<StatData, MergeError> {
    let target = root.join(path_from_bytes(path));
    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }

    if entry.mode.is_gitlink() {
        // Nested repositories materialize as bare directories.
        create_dir(&target)?;
        let meta = target.symlink_metadata()?;
        return Ok(StatData::from_metadata(&meta));
    }

    let data = store.read_blob(&entry.oid)?;

    if entry.mode.is_symlink() {
        let _ = fs::remove_file(&target);
        #[cfg(unix)]
        {
            let link = path_from_bytes(data.as_slice().as_bstr());
            std::os::unix::fs::symlink(link, &target)?;
        }
        #[cfg(not(unix))]
        fs::write(&target, &data)?;
    } else {
        fs::write(&target, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if entry.mode == FileMode::Executable {
                0o755
            } else {
                0o644
            };
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }

    let meta = target.symlink_metadata()?;
    Ok(StatData::from_metadata(&meta))
}

fn io_from_util(e: arbor_utils::UtilError) -> MergeError {
    match e {
        arbor_utils::UtilError::Io(io) => MergeError::Io(io),
        other => MergeError::Io(std::io::Error::other(other.to_string())),
    }
}
