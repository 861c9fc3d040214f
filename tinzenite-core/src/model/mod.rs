//! The tracked-model engine: single source of truth for on-disk state.
//!
//! The model owns the staticinfo map, drives scans, reconciles remote
//! updates, and produces the diffs used for model synchronization. All
//! mutation happens on the engine's event loop; methods take `&mut self` and
//! are never called concurrently.

mod removal;
mod scan;
mod staticinfo;

pub use removal::RemovalStore;
pub use staticinfo::{StaticInfo, TrackedMap};

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::hashing::hash_file;
use crate::ids::{MODEL_IDENTIFICATION, new_identification};
use crate::matcher::Matcher;
use crate::messages::UpdateMessage;
use crate::object::{ObjectInfo, Operation, UpdateEvent};
use crate::paths::{Layout, terminal_name};
use crate::version::VersionVector;

/// Outcome of reconciling one remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    /// Stale or already-known; disk and staticinfo untouched.
    IgnoreUpdate,
    /// A removal we already hold; the sender is newly marked as acknowledged.
    ObjectRemovalDone,
    /// Neither version dominates; the merge resolver takes over.
    Conflict,
}

pub struct Model {
    layout: Layout,
    self_id: String,
    matcher: Matcher,
    tracked: TrackedMap,
    removals: RemovalStore,
    events: Option<mpsc::Sender<UpdateEvent>>,
}

impl Model {
    pub fn new(layout: Layout, self_id: &str) -> Result<Model> {
        let matcher = Matcher::load(layout.root());
        let tracked = staticinfo::load(&layout.model_file())?;
        let removals = RemovalStore::new(layout.removed_dir());
        Ok(Model {
            layout,
            self_id: self_id.to_string(),
            matcher,
            tracked,
            removals,
            events: None,
        })
    }

    /// Install the sink update events are pushed to. The receiver must be
    /// drained after every `update` call; the channel is sized for a full
    /// scan's worth of events.
    pub fn register(&mut self, sink: mpsc::Sender<UpdateEvent>) {
        self.events = Some(sink);
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn removals(&self) -> &RemovalStore {
        &self.removals
    }

    pub fn is_tracked(&self, relative: &str) -> bool {
        self.tracked.contains_key(relative)
    }

    /// Reload ignore rules, e.g. after `.tinignore` itself changed.
    pub fn reload_matcher(&mut self) {
        self.matcher = Matcher::load(self.layout.root());
    }

    /// Flush the staticinfo snapshot.
    pub fn persist(&self) -> Result<()> {
        staticinfo::save(&self.layout.model_file(), &self.tracked)
    }

    /// Full rescan of the root.
    pub async fn update(&mut self) -> Result<()> {
        self.scan_apply(None).await
    }

    /// Rescan restricted to a subtree; absorbs internal writes without
    /// walking the world.
    pub async fn partial_update(&mut self, scope: &str) -> Result<()> {
        self.scan_apply(Some(scope)).await
    }

    async fn scan_apply(&mut self, scope: Option<&str>) -> Result<()> {
        if scope.is_none() {
            // `.tinignore` may itself have changed since the last full scan.
            self.reload_matcher();
        }
        let entries = scan::scan(self.layout.root(), &self.matcher, scope);
        let seen: HashSet<&str> = entries.iter().map(|e| e.relative.as_str()).collect();
        let in_scope = |rel: &str| match scope {
            None => true,
            Some(s) => rel == s || rel.starts_with(&format!("{s}/")),
        };

        // Removes run first, children before their parents.
        let mut missing: Vec<String> = self
            .tracked
            .keys()
            .filter(|rel| in_scope(rel) && !seen.contains(rel.as_str()))
            .cloned()
            .collect();
        missing.sort();
        for rel in missing.into_iter().rev() {
            let Some(mut info) = self.tracked.remove(&rel) else {
                continue;
            };
            info.version.increase(&self.self_id)?;
            self.removals
                .record(&info.identification, &[self.self_id.as_str()])?;
            let object = self.object_info(&rel, &info);
            self.emit(Operation::Remove, object).await;
        }

        for entry in &entries {
            match self.tracked.get(&entry.relative).cloned() {
                None => {
                    let content = if entry.directory {
                        String::new()
                    } else {
                        match hash_file(&self.layout.absolute(&entry.relative)) {
                            Ok(hash) => hash,
                            Err(err) => {
                                tracing::warn!(path = %entry.relative, "cannot hash new file: {err}");
                                continue;
                            }
                        }
                    };
                    let mut version = VersionVector::new();
                    version.increase(&self.self_id)?;
                    let info = StaticInfo {
                        identification: new_identification(),
                        version,
                        directory: entry.directory,
                        content,
                        modtime: entry.modtime,
                        shadow: false,
                    };
                    self.tracked.insert(entry.relative.clone(), info.clone());
                    let object = self.object_info(&entry.relative, &info);
                    self.emit(Operation::Create, object).await;
                }
                Some(info) if !entry.directory && info.modtime != entry.modtime => {
                    // Modtime is only the fast path; the hash decides.
                    let hash = match hash_file(&self.layout.absolute(&entry.relative)) {
                        Ok(hash) => hash,
                        Err(err) => {
                            tracing::warn!(path = %entry.relative, "cannot hash changed file: {err}");
                            continue;
                        }
                    };
                    if hash != info.content {
                        let mut info = info;
                        info.content = hash;
                        info.modtime = entry.modtime;
                        info.version.increase(&self.self_id)?;
                        self.tracked.insert(entry.relative.clone(), info.clone());
                        let object = self.object_info(&entry.relative, &info);
                        self.emit(Operation::Modify, object).await;
                    } else if let Some(entry_info) = self.tracked.get_mut(&entry.relative) {
                        entry_info.modtime = entry.modtime;
                    }
                }
                _ => {}
            }
        }

        self.persist()
    }

    pub fn get_info(&self, relative: &str) -> Result<ObjectInfo> {
        self.tracked
            .get(relative)
            .map(|info| self.object_info(relative, info))
            .ok_or_else(|| crate::error::Error::NotTracked(relative.to_string()))
    }

    pub fn get_info_from(&self, identification: &str) -> Result<ObjectInfo> {
        self.find_by_id(identification)
            .map(|(rel, info)| self.object_info(rel, info))
            .ok_or_else(|| crate::error::Error::NotTracked(identification.to_string()))
    }

    /// The full recursive tree, rooted at a synthetic node carrying the
    /// model identification.
    pub fn read(&self) -> ObjectInfo {
        let name = self
            .layout
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        ObjectInfo {
            identification: MODEL_IDENTIFICATION.to_string(),
            name,
            path: ".".to_string(),
            directory: true,
            shadow: false,
            version: VersionVector::new(),
            content: None,
            objects: Some(self.children_of(None)),
        }
    }

    fn children_of(&self, prefix: Option<&str>) -> Vec<ObjectInfo> {
        self.tracked
            .iter()
            .filter(|(rel, _)| crate::paths::parent(rel) == prefix)
            .map(|(rel, info)| {
                let mut object = self.object_info(rel, info);
                if info.directory {
                    object.objects = Some(self.children_of(Some(rel)));
                }
                object
            })
            .collect()
    }

    /// Reconcile one remote update. `sender` is the peer identification of
    /// the message's origin. Idempotent: a second identical apply returns
    /// `IgnoreUpdate` and leaves disk and staticinfo unchanged.
    pub fn apply_update(&mut self, msg: &UpdateMessage, sender: &str) -> Result<ApplyResult> {
        let object = &msg.object;
        let id = object.identification.as_str();

        if self.removals.is_removed(id) {
            return match msg.operation {
                Operation::Remove => {
                    if self.removals.acknowledge(id, sender)? {
                        Ok(ApplyResult::ObjectRemovalDone)
                    } else {
                        Ok(ApplyResult::IgnoreUpdate)
                    }
                }
                Operation::Create | Operation::Modify => Ok(ApplyResult::IgnoreUpdate),
            };
        }

        let local = self
            .find_by_id(id)
            .map(|(rel, info)| (rel.clone(), info.clone()));
        match (local, msg.operation) {
            (Some((rel, _)), Operation::Remove) => {
                self.apply_remove(&rel, sender)?;
                self.persist()?;
                Ok(ApplyResult::Applied)
            }
            (Some((rel, info)), _) => {
                // Create against an existing object behaves as a modify.
                let remote_hash = object.content.clone().unwrap_or_default();
                if object.version.includes(&info.version) {
                    if remote_hash == info.content {
                        return Ok(ApplyResult::IgnoreUpdate);
                    }
                    self.apply_overwrite(&rel, object)?;
                    self.persist()?;
                    Ok(ApplyResult::Applied)
                } else if info.version.includes(&object.version) {
                    Ok(ApplyResult::IgnoreUpdate)
                } else {
                    Ok(ApplyResult::Conflict)
                }
            }
            (None, Operation::Create | Operation::Modify) => {
                self.apply_create(object)?;
                self.persist()?;
                Ok(ApplyResult::Applied)
            }
            (None, Operation::Remove) => Ok(ApplyResult::IgnoreUpdate),
        }
    }

    /// Diff a foreign tree against local state. Applying the returned
    /// messages in order brings local state up to date.
    pub fn sync(&self, foreign: &ObjectInfo) -> Vec<UpdateMessage> {
        let mut messages = Vec::new();
        for object in foreign.flatten() {
            if object.identification == MODEL_IDENTIFICATION {
                continue;
            }
            if self.removals.is_removed(&object.identification) {
                continue;
            }
            match self.find_by_id(&object.identification) {
                Some((_, local)) => {
                    let same_hash = object.content.clone().unwrap_or_default() == local.content;
                    let remote_includes = object.version.includes(&local.version);
                    let local_includes = local.version.includes(&object.version);
                    let wanted = (remote_includes && !local_includes && !same_hash)
                        || (!remote_includes && !local_includes);
                    if wanted {
                        messages.push(UpdateMessage {
                            operation: Operation::Modify,
                            object: object.without_children(),
                        });
                    }
                }
                None => messages.push(UpdateMessage {
                    operation: Operation::Create,
                    object: object.without_children(),
                }),
            }
        }
        messages
    }

    /// First-contact variant of `sync`: where a local path coincides with a
    /// foreign object, the foreign identification is adopted so both sides
    /// share object history from here on.
    pub fn bootstrap(&mut self, foreign: &ObjectInfo) -> Result<Vec<UpdateMessage>> {
        let mut messages = Vec::new();
        for object in foreign.flatten() {
            if object.identification == MODEL_IDENTIFICATION {
                continue;
            }
            if let Some(info) = self.tracked.get_mut(&object.path) {
                info.identification = object.identification.clone();
                let same_hash = object.content.clone().unwrap_or_default() == info.content;
                if object.directory || same_hash {
                    info.version.merge(&object.version);
                } else {
                    messages.push(UpdateMessage {
                        operation: Operation::Modify,
                        object: object.without_children(),
                    });
                }
            } else {
                messages.push(UpdateMessage {
                    operation: Operation::Create,
                    object: object.without_children(),
                });
            }
        }
        self.persist()?;
        Ok(messages)
    }

    /// Every tracked file with local content, for the blind-store upload.
    pub fn non_directory_objects(&self) -> Vec<ObjectInfo> {
        self.tracked
            .iter()
            .filter(|(_, info)| !info.directory && !info.shadow)
            .map(|(rel, info)| self.object_info(rel, info))
            .collect()
    }

    /// Track a file that appeared on disk through the engine's own doing
    /// (conflict sibling). Emits a `Create` so the fleet learns about it.
    pub(crate) async fn create_local(&mut self, relative: &str) -> Result<ObjectInfo> {
        let abs = self.layout.absolute(relative);
        let metadata = fs::metadata(&abs)?;
        let directory = metadata.is_dir();
        let content = if directory {
            String::new()
        } else {
            hash_file(&abs)?
        };
        let mut version = VersionVector::new();
        version.increase(&self.self_id)?;
        let info = StaticInfo {
            identification: new_identification(),
            version,
            directory,
            content,
            modtime: DateTime::<Utc>::from(metadata.modified()?),
            shadow: false,
        };
        self.tracked.insert(relative.to_string(), info.clone());
        self.persist()?;
        let object = self.object_info(relative, &info);
        self.emit(Operation::Create, object.clone()).await;
        Ok(object)
    }

    /// Untrack a path whose on-disk file the engine already moved away.
    /// Emits a `Remove`.
    pub(crate) async fn remove_local(&mut self, relative: &str) -> Result<()> {
        let Some(mut info) = self.tracked.remove(relative) else {
            return Ok(());
        };
        info.version.increase(&self.self_id)?;
        self.removals
            .record(&info.identification, &[self.self_id.as_str()])?;
        self.persist()?;
        let object = self.object_info(relative, &info);
        self.emit(Operation::Remove, object).await;
        Ok(())
    }

    /// Replace an object's version vector without touching content. The
    /// modify-in-place arm of conflict resolution.
    pub(crate) fn adopt_version(&mut self, identification: &str, version: &VersionVector) -> Result<()> {
        let rel = self.find_by_id(identification).map(|(rel, _)| rel.clone());
        if let Some(rel) = rel {
            if let Some(info) = self.tracked.get_mut(&rel) {
                info.version = version.clone();
            }
            self.persist()?;
        }
        Ok(())
    }

    /// Publish an event for an object the engine materialized itself, so the
    /// fleet converges on it (remote applies are otherwise silent).
    pub(crate) async fn announce(&self, operation: Operation, object: ObjectInfo) {
        self.emit(operation, object).await;
    }

    fn find_by_id(&self, identification: &str) -> Option<(&String, &StaticInfo)> {
        self.tracked
            .iter()
            .find(|(_, info)| info.identification == identification)
    }

    fn object_info(&self, relative: &str, info: &StaticInfo) -> ObjectInfo {
        ObjectInfo {
            identification: info.identification.clone(),
            name: terminal_name(relative).to_string(),
            path: relative.to_string(),
            directory: info.directory,
            shadow: info.shadow,
            version: info.version.clone(),
            content: if info.directory {
                None
            } else {
                Some(info.content.clone())
            },
            objects: None,
        }
    }

    async fn emit(&self, operation: Operation, object: ObjectInfo) {
        if let Some(sink) = &self.events {
            if sink.send(UpdateEvent { operation, object }).await.is_err() {
                tracing::warn!("update event dropped: sink closed");
            }
        }
    }

    fn apply_create(&mut self, object: &ObjectInfo) -> Result<()> {
        let abs = self.layout.absolute(&object.path);
        if object.directory {
            fs::create_dir_all(&abs)?;
        } else if !object.shadow {
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(self.layout.temp_file(&object.identification), &abs)?;
        }
        let modtime = if object.shadow {
            Utc::now()
        } else {
            DateTime::<Utc>::from(fs::metadata(&abs)?.modified()?)
        };
        self.tracked.insert(
            object.path.clone(),
            StaticInfo {
                identification: object.identification.clone(),
                version: object.version.clone(),
                directory: object.directory,
                content: object.content.clone().unwrap_or_default(),
                modtime,
                shadow: object.shadow,
            },
        );
        Ok(())
    }

    fn apply_overwrite(&mut self, relative: &str, object: &ObjectInfo) -> Result<()> {
        let abs = self.layout.absolute(relative);
        if !object.directory && !object.shadow {
            // Atomic replace via rename; the temp file is consumed.
            fs::rename(self.layout.temp_file(&object.identification), &abs)?;
        }
        let modtime = if object.shadow {
            Utc::now()
        } else {
            DateTime::<Utc>::from(fs::metadata(&abs)?.modified()?)
        };
        if let Some(info) = self.tracked.get_mut(relative) {
            info.version = object.version.clone();
            info.content = object.content.clone().unwrap_or_default();
            info.modtime = modtime;
            info.shadow = object.shadow;
        }
        Ok(())
    }

    fn apply_remove(&mut self, relative: &str, sender: &str) -> Result<()> {
        let Some(info) = self.tracked.get(relative).cloned() else {
            return Ok(());
        };
        let abs = self.layout.absolute(relative);
        if info.directory {
            if abs.exists() {
                fs::remove_dir_all(&abs)?;
            }
        } else if let Err(err) = fs::remove_file(&abs) {
            if err.kind() != ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        self.tracked.remove(relative);
        // A removed directory takes its tracked children with it.
        let prefix = format!("{relative}/");
        let children: Vec<String> = self
            .tracked
            .keys()
            .filter(|rel| rel.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            if let Some(child_info) = self.tracked.remove(&child) {
                self.removals
                    .record(&child_info.identification, &[self.self_id.as_str(), sender])?;
            }
        }
        self.removals
            .record(&info.identification, &[self.self_id.as_str(), sender])?;
        Ok(())
    }
}
