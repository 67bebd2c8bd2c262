use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const ORT_LIB: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<ORT_LIB> near current exe/cwd
/// 3) the platform's usual system library directories
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let roots = search_roots();
    if let Some(found) = find_ort_library(&roots) {
        // SAFETY: called once from main before the runtime starts any worker
        // threads or ORT sessions, so nothing reads the environment concurrently.
        unsafe {
            std::env::set_var("ORT_DYLIB_PATH", &found);
        }
        tracing::info!(path = %found.display(), "configured ORT_DYLIB_PATH");
        return;
    }

    tracing::warn!(
        lib = ORT_LIB,
        "could not locate ONNX Runtime; set ORT_DYLIB_PATH to an official ONNX Runtime build"
    );
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots
}

fn find_ort_library(roots: &[PathBuf]) -> Option<PathBuf> {
    candidates(roots).into_iter().find(|c| c.is_file())
}

fn candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB));
        candidates.push(root.join("models").join(ORT_LIB));
    }

    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB));
    } else if cfg!(unix) {
        candidates.push(PathBuf::from("/usr/local/lib").join(ORT_LIB));
        candidates.push(PathBuf::from("/usr/lib").join(ORT_LIB));
    }
    candidates
}
