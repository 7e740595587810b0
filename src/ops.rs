use crate::pathutil::find_last_file;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("invalid operation action: '{0}'")]
    UnknownAction(String),
    #[error("invalid {action} operation format - {expected}")]
    BadArgs {
        action: &'static str,
        expected: &'static str,
    },
    #[error("invalid rename pattern: {0}")]
    BadPattern(String),
    #[error("{0}")]
    Io(String),
    #[error("install command failed: {0}")]
    ExecFailed(String),
}

/// A post-install operation from the update manifest. Aliases are folded
/// into the canonical action at parse time, so application never re-examines
/// action strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Exec { cmd: String, args: Vec<String> },
    BatchRename {
        root: String,
        find: String,
        replacement: String,
    },
    Move { src: String, dest: String },
    Copy { src: String, dest: String },
    Remove { pattern: String },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Exec { cmd, args } => write!(f, "exec ({cmd}, {})", args.join(", ")),
            Op::BatchRename {
                root,
                find,
                replacement,
            } => write!(f, "batch-rename ({root}, {find}, {replacement})"),
            Op::Move { src, dest } => write!(f, "move ({src}, {dest})"),
            Op::Copy { src, dest } => write!(f, "copy ({src}, {dest})"),
            Op::Remove { pattern } => write!(f, "remove ({pattern})"),
        }
    }
}

impl Op {
    pub fn parse(action: &str, args: &[String]) -> Result<Op, OpError> {
        match action.to_lowercase().as_str() {
            "exec" | "run" => {
                let Some((cmd, rest)) = args.split_first() else {
                    return Err(OpError::BadArgs {
                        action: "exec",
                        expected: "arg expected",
                    });
                };
                Ok(Op::Exec {
                    cmd: cmd.clone(),
                    args: rest.to_vec(),
                })
            }
            "batchrename" | "batch-rename" => match args {
                [root, find, replacement] => Ok(Op::BatchRename {
                    root: root.clone(),
                    find: find.clone(),
                    replacement: replacement.clone(),
                }),
                _ => Err(OpError::BadArgs {
                    action: "rename",
                    expected: "three args expected",
                }),
            },
            "move" | "mv" => match args {
                [src, dest] => Ok(Op::Move {
                    src: src.clone(),
                    dest: dest.clone(),
                }),
                _ => Err(OpError::BadArgs {
                    action: "move",
                    expected: "two args expected",
                }),
            },
            "copy" | "cp" => match args {
                [src, dest] => Ok(Op::Copy {
                    src: src.clone(),
                    dest: dest.clone(),
                }),
                _ => Err(OpError::BadArgs {
                    action: "copy",
                    expected: "two args expected",
                }),
            },
            "remove" | "rm" | "del" | "delete" => match args {
                [pattern] => Ok(Op::Remove {
                    pattern: pattern.clone(),
                }),
                _ => Err(OpError::BadArgs {
                    action: "remove",
                    expected: "one arg file expected",
                }),
            },
            other => Err(OpError::UnknownAction(other.to_string())),
        }
    }

    /// Apply the operation with relative paths resolved against `root`.
    pub fn apply(&self, root: &Path) -> Result<(), OpError> {
        match self {
            Op::Exec { cmd, args } => exec_op(root, cmd, args),
            Op::BatchRename {
                root: pattern,
                find,
                replacement,
            } => batch_rename_op(&resolve(root, pattern), find, replacement),
            Op::Move { src, dest } => {
                let src = find_last_file(&resolve(root, src));
                let dest = resolve(root, dest);
                println!("Moving '{src}' to '{dest}'...");
                std::fs::rename(&src, &dest).map_err(|e| OpError::Io(e.to_string()))
            }
            Op::Copy { src, dest } => {
                let src = find_last_file(&resolve(root, src));
                let dest = resolve(root, dest);
                println!("Copying '{src}' to '{dest}'...");
                std::fs::copy(&src, &dest)
                    .map(|_| ())
                    .map_err(|e| OpError::Io(e.to_string()))
            }
            Op::Remove { pattern } => remove_op(&resolve(root, pattern)),
        }
    }
}

fn resolve(root: &Path, path: &str) -> String {
    if Path::new(path).is_absolute() {
        path.to_string()
    } else {
        root.join(path).to_string_lossy().into_owned()
    }
}

fn exec_op(root: &Path, cmd: &str, args: &[String]) -> Result<(), OpError> {
    let resolved = resolve(root, cmd);
    println!("Running install command: {resolved} {}", args.join(" "));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&resolved, std::fs::Permissions::from_mode(0o755));
    }

    let status = std::process::Command::new(&resolved)
        .args(args)
        .current_dir(root)
        .status()
        .map_err(|e| OpError::ExecFailed(e.to_string()))?;
    if !status.success() {
        return Err(OpError::ExecFailed(format!("exit status {status}")));
    }
    Ok(())
}

fn batch_rename_op(root_pattern: &str, find: &str, replacement: &str) -> Result<(), OpError> {
    println!("Running batch rename operation on root {root_pattern} ('{find}' => '{replacement}')");

    let matches: Vec<PathBuf> = glob::glob(root_pattern)
        .map_err(|e| OpError::BadPattern(e.to_string()))?
        .filter_map(|p| p.ok())
        .collect();
    if matches.is_empty() {
        return Ok(());
    }

    let re = Regex::new(find).map_err(|e| OpError::BadPattern(e.to_string()))?;

    let mut entries = Vec::new();
    for m in &matches {
        walk(m, &mut entries);
    }
    // Rename children before parents so earlier renames never invalidate
    // deeper paths.
    entries.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut rename_count = 0;
    for path in entries {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let new_name = re.replace_all(&name, replacement).into_owned();
        if new_name == name || !path.exists() {
            continue;
        }
        let new_path = path.parent().unwrap_or(Path::new("")).join(&new_name);
        println!("Renaming '{}' to '{}' ...", path.display(), new_path.display());
        std::fs::rename(&path, &new_path).map_err(|e| OpError::Io(e.to_string()))?;
        rename_count += 1;
    }
    println!("Renamed {rename_count} files.");
    Ok(())
}

fn walk(path: &Path, out: &mut Vec<PathBuf>) {
    out.push(path.to_path_buf());
    if path.is_dir()
        && let Ok(entries) = std::fs::read_dir(path)
    {
        for entry in entries.flatten() {
            walk(&entry.path(), out);
        }
    }
}

/// Best-effort removal: each match is removed independently and failures are
/// reported but never abort the update.
fn remove_op(pattern: &str) -> Result<(), OpError> {
    let matches = glob::glob(pattern).map_err(|e| OpError::BadPattern(e.to_string()))?;

    let mut remove_count = 0;
    for m in matches.filter_map(|p| p.ok()) {
        println!("Removing '{}' ...", m.display());
        let result = if m.is_dir() {
            std::fs::remove_dir_all(&m)
        } else {
            std::fs::remove_file(&m)
        };
        if let Err(e) = result {
            println!("Problem removing {}: {e}", m.display());
        }
        remove_count += 1;
    }
    println!("Removed {remove_count} files.");
    Ok(())
}
