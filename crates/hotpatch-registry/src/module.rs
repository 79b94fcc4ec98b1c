//! Live modules and their compiland database
//!
//! A module is keyed by image-header fingerprint, not path: two processes
//! that loaded the same binary share one `LiveModule` and its symbol data,
//! no matter where each mapped it. The compiland records live in the
//! injected pools; the module holds handles.

use crate::file_cache::FileAttributeCache;
use crate::pools::PoolSet;
use crate::ports::{CompileUnit, Contribution, PatchImage, ProcessControl, SymbolSession};
use hotpatch_core::{
    Handle, ImageFingerprint, ModuleBase, ModulePath, ProcessId, Result,
};
use hotpatch_watch::DirectoryCache;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ModuleId(pub u64);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// A file a compiland depends on, with the write time recorded when the
/// dependency was last known good.
pub struct Dependency {
    pub path: PathBuf,
    pub last_write: Option<SystemTime>,
}

/// One translation unit of a live module.
pub struct Compiland {
    pub object_path: PathBuf,
    pub source_path: PathBuf,
    pub compiler_path: PathBuf,
    pub command_line: String,
    /// Shared watch entry for the source directory.
    pub directory: std::sync::Arc<hotpatch_watch::Directory>,
    /// Source file first, then headers.
    pub dependencies: Vec<Handle<Dependency>>,
    pub contributions: Vec<Handle<Contribution>>,
}

pub struct LiveModule {
    id: ModuleId,
    path: ModulePath,
    fingerprint: ImageFingerprint,
    linker_path: PathBuf,
    compilands: HashMap<PathBuf, Handle<Compiland>>,
    /// Every process that has this image mapped, with its base there.
    members: Vec<(ProcessId, ModuleBase)>,
    patches: Vec<PatchImage>,
}

impl LiveModule {
    /// Build the compiland database from an opened symbol session. This is
    /// the expensive part of enabling a module; callers run it on a worker
    /// task and only then insert the module under the registry lock.
    pub fn load(
        id: ModuleId,
        path: ModulePath,
        fingerprint: ImageFingerprint,
        session: &dyn SymbolSession,
        pools: &PoolSet,
        directories: &DirectoryCache,
        files: &FileAttributeCache,
    ) -> Result<Self> {
        let records = session.gather_compilands()?;
        let linker_path = session.linker_path()?;

        let mut compilands = HashMap::with_capacity(records.len());
        for record in records {
            let dir_path = record
                .source_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let directory = directories.add_directory(&dir_path)?;

            let mut dependencies = Vec::with_capacity(record.dependencies.len() + 1);
            for dep_path in std::iter::once(&record.source_path).chain(&record.dependencies) {
                dependencies.push(pools.dependencies.alloc(Dependency {
                    path: dep_path.clone(),
                    last_write: files.last_write(dep_path),
                }));
            }
            let contributions = record
                .contributions
                .iter()
                .map(|c| pools.contributions.alloc(*c))
                .collect();

            let object_path = record.object_path.clone();
            let handle = pools.compilands.alloc(Compiland {
                object_path: record.object_path,
                source_path: record.source_path,
                compiler_path: record.compiler_path,
                command_line: record.command_line,
                directory,
                dependencies,
                contributions,
            });
            compilands.insert(object_path, handle);
        }

        info!(
            module = %path,
            %fingerprint,
            compilands = compilands.len(),
            "module loaded"
        );
        Ok(Self {
            id,
            path,
            fingerprint,
            linker_path,
            compilands,
            members: Vec::new(),
            patches: Vec::new(),
        })
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn path(&self) -> &ModulePath {
        &self.path
    }

    pub fn fingerprint(&self) -> ImageFingerprint {
        self.fingerprint
    }

    pub fn linker_path(&self) -> &std::path::Path {
        &self.linker_path
    }

    pub fn compiland_count(&self) -> usize {
        self.compilands.len()
    }

    /// Unique compiler paths across all compilands, for prewarming.
    pub fn compiler_paths(&self, pools: &PoolSet) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for handle in self.compilands.values() {
            if let Ok(path) = pools.compilands.with(*handle, |c| c.compiler_path.clone()) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    pub fn register_process(&mut self, pid: ProcessId, base: ModuleBase) {
        if !self.members.iter().any(|(p, _)| *p == pid) {
            self.members.push((pid, base));
        }
    }

    /// Returns true when the module has no members left.
    pub fn unregister_process(&mut self, pid: ProcessId) -> bool {
        self.members.retain(|(p, _)| *p != pid);
        self.members.is_empty()
    }

    pub fn members(&self) -> &[(ProcessId, ModuleBase)] {
        &self.members
    }

    pub fn base_in(&self, pid: ProcessId) -> Option<ModuleBase> {
        self.members
            .iter()
            .find(|(p, _)| *p == pid)
            .map(|(_, base)| *base)
    }

    // ------------------------------------------------------------------
    // Patches
    // ------------------------------------------------------------------

    pub fn has_installed_patches(&self) -> bool {
        !self.patches.is_empty()
    }

    pub fn next_patch_index(&self) -> u32 {
        self.patches.len() as u32
    }

    pub fn record_patch(&mut self, patch: PatchImage) {
        self.patches.push(patch);
    }

    pub fn patches(&self) -> &[PatchImage] {
        &self.patches
    }

    /// Bring a process that joined after patches were built up to date.
    /// All-or-nothing: the first failure aborts and the caller unregisters
    /// the process from this module again.
    pub fn install_compiled_patches(
        &self,
        control: &dyn ProcessControl,
        pid: ProcessId,
    ) -> Result<()> {
        for patch in &self.patches {
            control.install_patch(pid, patch)?;
        }
        debug!(module = %self.path, %pid, patches = self.patches.len(), "patches replayed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Change scanning
    // ------------------------------------------------------------------

    /// Object files whose compiland changed since the last pass. Dependency
    /// mtimes are only consulted for compilands whose directory flag is set.
    pub fn changed_objects(&self, pools: &PoolSet, files: &FileAttributeCache) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        for handle in self.compilands.values() {
            let hit = pools
                .compilands
                .with(*handle, |c| {
                    if !c.directory.had_change() {
                        return None;
                    }
                    let dirty = c.dependencies.iter().any(|dep| {
                        pools
                            .dependencies
                            .with(*dep, |d| match d.last_write {
                                Some(baseline) => files.changed_since(&d.path, baseline),
                                None => files.last_write(&d.path).is_some(),
                            })
                            .unwrap_or(false)
                    });
                    dirty.then(|| c.object_path.clone())
                })
                .ok()
                .flatten();
            if let Some(object) = hit {
                changed.push(object);
            }
        }
        changed
    }

    /// After a successful build, re-baseline the dependencies of the built
    /// objects so the same edit does not retrigger next pass.
    pub fn refresh_baselines(
        &self,
        objects: &[PathBuf],
        pools: &PoolSet,
        files: &FileAttributeCache,
    ) {
        for object in objects {
            let Some(handle) = self.compilands.get(object) else {
                continue;
            };
            let deps = pools
                .compilands
                .with(*handle, |c| c.dependencies.clone())
                .unwrap_or_default();
            for dep in deps {
                let _ = pools.dependencies.with_mut(dep, |d| {
                    d.last_write = files.last_write(&d.path);
                });
            }
        }
    }

    /// Compiler invocations for the given objects. Objects not in this
    /// module are skipped; the caller validated membership already.
    pub fn compile_units(&self, objects: &[PathBuf], pools: &PoolSet) -> Vec<CompileUnit> {
        objects
            .iter()
            .filter_map(|object| self.compilands.get(object))
            .filter_map(|handle| {
                pools
                    .compilands
                    .with(*handle, |c| CompileUnit {
                        source_path: c.source_path.clone(),
                        object_path: c.object_path.clone(),
                        compiler_path: c.compiler_path.clone(),
                        command_line: c.command_line.clone(),
                    })
                    .ok()
            })
            .collect()
    }

    pub fn contains_object(&self, object: &std::path::Path) -> bool {
        self.compilands.contains_key(object)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Return all pooled records. Called when the last member leaves.
    pub fn unload(&mut self, pools: &PoolSet) {
        for handle in self.compilands.values() {
            let freed = pools.compilands.free(*handle);
            debug_assert!(freed.is_ok(), "compiland handle freed twice");
            if let Ok(compiland) = freed {
                for dep in compiland.dependencies {
                    let _ = pools.dependencies.free(dep);
                }
                for contribution in compiland.contributions {
                    let _ = pools.contributions.free(contribution);
                }
            }
        }
        self.compilands.clear();
        info!(module = %self.path, "module unloaded");
    }
}
