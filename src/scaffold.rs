//! Workspace scaffolding from `<root>/templates/<name>/`.

use crate::Result;
use crate::storage::{Layout, METADATA_FILE, REPOS_DIR};
use std::fs;
use std::path::Path;

/// Copy the named template into a freshly created workspace.
///
/// `{{workspace_id}}` and `{{title}}` are substituted in UTF-8 files; other
/// files are copied byte for byte. A missing template is not an error.
/// Returns the number of files written.
pub fn apply(
    layout: &Layout,
    template: &str,
    workspace_path: &Path,
    id: &str,
    title: &str,
) -> Result<usize> {
    let source = layout.template_dir(template);
    if !source.is_dir() {
        tracing::debug!(template, "no workspace template");
        return Ok(0);
    }
    copy_dir(&source, workspace_path, id, title, true)
}

fn copy_dir(from: &Path, to: &Path, id: &str, title: &str, top: bool) -> Result<usize> {
    fs::create_dir_all(to)?;
    let mut written = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        // These names belong to berth at the top of a workspace.
        if top && (name == REPOS_DIR || name == METADATA_FILE) {
            continue;
        }
        let target = to.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            written += copy_dir(&entry.path(), &target, id, title, false)?;
        } else if file_type.is_file() {
            let bytes = fs::read(entry.path())?;
            match String::from_utf8(bytes) {
                Ok(text) => fs::write(
                    &target,
                    text.replace("{{workspace_id}}", id)
                        .replace("{{title}}", title),
                )?,
                Err(raw) => fs::write(&target, raw.into_bytes())?,
            }
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_substitutes_and_skips_reserved_names() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let template = layout.template_dir("default");
        fs::create_dir_all(template.join("notes")).unwrap();
        fs::create_dir_all(template.join("repos")).unwrap();
        fs::write(template.join("README.md"), "# {{workspace_id}}: {{title}}\n").unwrap();
        fs::write(template.join("notes/todo.md"), "- {{workspace_id}}\n").unwrap();
        fs::write(template.join("workspace.json"), "{}").unwrap();
        fs::write(template.join("logo.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let ws = temp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        let written = apply(&layout, "default", &ws, "WS1", "Login fix").unwrap();

        assert_eq!(written, 3);
        assert_eq!(
            fs::read_to_string(ws.join("README.md")).unwrap(),
            "# WS1: Login fix\n"
        );
        assert_eq!(fs::read_to_string(ws.join("notes/todo.md")).unwrap(), "- WS1\n");
        assert_eq!(fs::read(ws.join("logo.bin")).unwrap(), vec![0xff, 0xfe, 0x00]);
        assert!(!ws.join("repos").exists());
        assert!(!ws.join("workspace.json").exists());
    }

    #[test]
    fn test_missing_template_is_fine() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        assert_eq!(apply(&layout, "default", temp.path(), "WS1", "t").unwrap(), 0);
    }
}
