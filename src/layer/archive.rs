//! Layer archives
//!
//! Deltas serialize to plain tar streams with fixed ownership and timestamps,
//! so identical deltas always produce identical bytes. Deletions use the OCI
//! whiteout convention: `dir/.wh.name` removes `dir/name`.

use crate::error::{StrataError, StrataResult};
use crate::layer::delta::{Entry, LayerDelta};
use crate::paths;
use std::io::{self, Read, Write};
use std::path::Component;
use tar::{Archive, Builder, EntryType, Header};

const WHITEOUT_PREFIX: &str = ".wh.";

/// Write `delta` as a tar stream
pub fn write_delta<W: Write>(delta: &LayerDelta, writer: W) -> StrataResult<W> {
    let mut builder = Builder::new(writer);

    for (path, entry) in delta.entries() {
        let result = match entry {
            Entry::File { mode, content } => {
                let mut header = base_header(EntryType::Regular, *mode);
                header.set_size(content.len() as u64);
                builder.append_data(&mut header, path, &content[..])
            }
            Entry::Dir { mode } => {
                let mut header = base_header(EntryType::Directory, *mode);
                builder.append_data(&mut header, path, io::empty())
            }
            Entry::Symlink { target } => {
                let mut header = base_header(EntryType::Symlink, 0o777);
                builder.append_link(&mut header, path, target)
            }
            Entry::Whiteout => {
                let name = whiteout_name(path);
                let mut header = base_header(EntryType::Regular, 0o644);
                builder.append_data(&mut header, name, io::empty())
            }
        };
        result.map_err(|e| StrataError::io(format!("archiving {}", path), e))?;
    }

    builder
        .into_inner()
        .map_err(|e| StrataError::io("finalizing layer archive", e))
}

/// Read a tar stream written by [`write_delta`]
pub fn read_delta<R: Read>(reader: R, layer: &str) -> StrataResult<LayerDelta> {
    let mut archive = Archive::new(reader);
    let mut delta = LayerDelta::new();

    let entries = archive
        .entries()
        .map_err(|e| StrataError::io(format!("reading layer {}", layer), e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| StrataError::io(format!("reading layer {}", layer), e))?;
        let raw_path = entry
            .path()
            .map_err(|e| StrataError::io(format!("reading layer {}", layer), e))?
            .into_owned();

        if raw_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(corrupt(layer, format!("unsafe path {}", raw_path.display())));
        }
        let path = raw_path.to_string_lossy().trim_end_matches('/').to_string();

        let name = path.rsplit('/').next().unwrap_or_default();
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            delta.insert(paths::join(paths::parent(&path), hidden), Entry::Whiteout);
            continue;
        }

        let mode = entry
            .header()
            .mode()
            .map_err(|e| corrupt(layer, e.to_string()))?;

        let parsed = match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                let mut content = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut content)
                    .map_err(|e| StrataError::io(format!("reading {} in layer {}", path, layer), e))?;
                Entry::file(mode & 0o7777, content)
            }
            EntryType::Directory => Entry::Dir { mode: mode & 0o7777 },
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| corrupt(layer, e.to_string()))?
                    .ok_or_else(|| corrupt(layer, format!("symlink {} has no target", path)))?;
                Entry::Symlink {
                    target: target.to_string_lossy().into_owned(),
                }
            }
            other => {
                return Err(corrupt(
                    layer,
                    format!("unsupported entry type {:?} at {}", other, path),
                ))
            }
        };
        delta.insert(path, parsed);
    }

    Ok(delta)
}

fn base_header(kind: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(0);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn whiteout_name(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    paths::join(paths::parent(path), &format!("{}{}", WHITEOUT_PREFIX, name))
}

fn corrupt(layer: &str, reason: String) -> StrataError {
    StrataError::LayerCorrupt {
        id: layer.to_string(),
        reason,
    }
}
