//! Picks the provisioning source for a VM.
//!
//! Priority, first populated descriptor wins: template, PVM image,
//! snapshot, ISO. Exclusivity is not checked here.

use std::fmt;
use std::path::Path;

use crate::vm::{SnapshotSource, TemplateSource, VmSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Template,
    PvmImage,
    Snapshot,
    Iso,
    None,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceType::Template => "template",
            SourceType::PvmImage => "pvm image",
            SourceType::Snapshot => "snapshot",
            SourceType::Iso => "iso",
            SourceType::None => "none",
        })
    }
}

/// The selected source together with its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source<'a> {
    Template(&'a TemplateSource),
    PvmImage(&'a Path),
    Snapshot(&'a SnapshotSource),
    Iso(&'a Path),
}

impl Source<'_> {
    pub fn kind(&self) -> SourceType {
        match self {
            Source::Template(_) => SourceType::Template,
            Source::PvmImage(_) => SourceType::PvmImage,
            Source::Snapshot(_) => SourceType::Snapshot,
            Source::Iso(_) => SourceType::Iso,
        }
    }
}

fn non_empty(path: &Path) -> bool {
    !path.as_os_str().is_empty()
}

pub fn select(spec: &VmSpec) -> Option<Source<'_>> {
    if let Some(t) = spec.template.as_ref().filter(|t| !t.name.is_empty()) {
        return Some(Source::Template(t));
    }
    if let Some(p) = spec.pvm_import.as_deref().filter(|p| non_empty(p)) {
        return Some(Source::PvmImage(p));
    }
    if let Some(s) = spec.snapshot.as_ref().filter(|s| !s.snapshot_id.is_empty()) {
        return Some(Source::Snapshot(s));
    }
    if let Some(p) = spec.iso_install.as_deref().filter(|p| non_empty(p)) {
        return Some(Source::Iso(p));
    }
    None
}

pub fn resolve(spec: &VmSpec) -> SourceType {
    select(spec).map_or(SourceType::None, |s| s.kind())
}
