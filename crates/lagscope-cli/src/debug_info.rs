//! Offline symbolication from the DWARF debug info of each image.
//!
//! `dladdr` only knows exported symbols. Everything else (static functions,
//! inlined frames, file and line) comes from the image file on disk, loaded
//! once per image and cached.

use addr2line::Loader;
use lagscope_types::StackFrame;
use object::{Object, ObjectSegment};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

struct ModuleResolver {
    loader: Loader,
    linked_image_base: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Resolved {
    function: Option<String>,
    file: Option<String>,
    line: Option<u32>,
}

impl ModuleResolver {
    fn new(path: &str) -> Result<Self, String> {
        let module_path = Path::new(path);
        if !module_path.is_file() {
            return Err(format!("image path is not a file: {path}"));
        }
        let loader = Loader::new(module_path)
            .map_err(|e| format!("failed to load debug data for {path}: {e}"))?;
        let linked_image_base = linked_image_base_for_file(module_path)?;
        Ok(Self {
            loader,
            linked_image_base,
        })
    }

    fn resolve(&self, linked_address: u64) -> Result<Resolved, String> {
        let mut resolved = Resolved::default();
        let mut frames = self
            .loader
            .find_frames(linked_address)
            .map_err(|e| format!("find_frames failed at 0x{linked_address:x}: {e}"))?;

        // The innermost frame comes first; that is the one we report.
        if let Some(frame) = frames
            .next()
            .map_err(|e| format!("iterating frames failed at 0x{linked_address:x}: {e}"))?
        {
            if let Some(function) = frame.function {
                resolved.function = function
                    .demangle()
                    .map(|name| name.into_owned())
                    .or_else(|_| function.raw_name().map(|name| name.into_owned()))
                    .ok();
            }
            if let Some(location) = frame.location {
                resolved.file = location.file.map(str::to_owned);
                resolved.line = location.line;
            }
        }

        if resolved.function.is_none() {
            resolved.function = self.loader.find_symbol(linked_address).map(str::to_owned);
        }
        if resolved.file.is_none() {
            if let Some(location) = self
                .loader
                .find_location(linked_address)
                .map_err(|e| format!("find_location failed at 0x{linked_address:x}: {e}"))?
            {
                resolved.file = location.file.map(str::to_owned);
                resolved.line = location.line;
            }
        }
        Ok(resolved)
    }
}

fn linked_image_base_for_file(path: &Path) -> Result<u64, String> {
    let data =
        fs::read(path).map_err(|e| format!("failed to read image {}: {e}", path.display()))?;
    let object = object::File::parse(&*data)
        .map_err(|e| format!("failed to parse image {}: {e}", path.display()))?;
    object
        .segments()
        .filter_map(|segment| {
            let (_, file_size) = segment.file_range();
            (file_size != 0).then(|| segment.address())
        })
        .min()
        .ok_or_else(|| format!("image {} has no file-backed segments", path.display()))
}

/// Per-image cache of debug info; images without any are remembered too.
#[derive(Default)]
pub(crate) struct DebugInfo {
    modules: HashMap<String, Option<ModuleResolver>>,
}

impl DebugInfo {
    /// Fills `function`, `file` and `line` of every frame whose image could be
    /// loaded. Frames past the first are looked up at `address - 1`, inside the
    /// call instruction rather than after it.
    pub(crate) fn annotate(&mut self, frames: &mut [StackFrame]) {
        for (index, frame) in frames.iter_mut().enumerate() {
            let Some(image) = frame.image.as_deref() else {
                continue;
            };
            if frame.image_base == 0 {
                continue;
            }
            let lookup = if index == 0 {
                frame.address
            } else {
                frame.address.saturating_sub(1)
            };
            let Some(offset) = lookup.checked_sub(frame.image_base) else {
                continue;
            };

            let resolver = self
                .modules
                .entry(image.to_owned())
                .or_insert_with(|| match ModuleResolver::new(image) {
                    Ok(resolver) => Some(resolver),
                    Err(err) => {
                        tracing::debug!(%err, "no debug info for image");
                        None
                    }
                });
            let Some(resolver) = resolver else {
                continue;
            };
            let Some(linked_address) = resolver.linked_image_base.checked_add(offset) else {
                continue;
            };

            match resolver.resolve(linked_address) {
                Ok(resolved) => {
                    frame.function = resolved.function;
                    frame.file = resolved.file;
                    frame.line = resolved.line;
                }
                Err(err) => tracing::debug!(%err, "debug info lookup failed"),
            }
        }
    }
}
