// Compiles the GLSL sources under resources/shaders into SPIR-V with glslc.
// The engine loads the .spv files at runtime; set SKIP_SHADERS to bypass
// compilation on machines without the Vulkan SDK.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=../../resources/shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let glslc = match find_glslc() {
        Some(path) => path,
        None => {
            eprintln!("warning: glslc not found (install the Vulkan SDK); shader compilation skipped");
            return;
        }
    };

    let shader_dir = PathBuf::from("../../resources/shaders");
    let target_dir = PathBuf::from("../../target/shaders");
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        eprintln!("warning: failed to create {:?}: {}", target_dir, e);
        return;
    }

    let entries = match std::fs::read_dir(&shader_dir) {
        Ok(entries) => entries,
        Err(_) => {
            eprintln!("info: no shader directory at {:?}", shader_dir);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_shader = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("vert") | Some("frag") | Some("comp")
        );
        if !is_shader {
            continue;
        }

        let out_file = target_dir
            .join(path.file_name().unwrap())
            .with_extension(format!(
                "{}.spv",
                path.extension().unwrap().to_string_lossy()
            ));
        // e.g. quad.vert -> quad.vert.spv

        if up_to_date(&path, &out_file) {
            continue;
        }

        let status = Command::new(&glslc).arg(&path).arg("-o").arg(&out_file).status();
        match status {
            Ok(s) if s.success() => {
                eprintln!("info: compiled {:?}", path.file_name().unwrap());
            }
            Ok(s) => panic!("glslc failed for {:?} (exit {:?})", path, s.code()),
            Err(e) => panic!("failed to run glslc for {:?}: {}", path, e),
        }
    }
}

fn find_glslc() -> Option<PathBuf> {
    if let Ok(sdk) = env::var("VULKAN_SDK") {
        let candidate = if cfg!(target_os = "windows") {
            Path::new(&sdk).join("Bin").join("glslc.exe")
        } else {
            Path::new(&sdk).join("bin").join("glslc")
        };
        if candidate.exists() {
            return Some(candidate);
        }
    }
    // Fall back to PATH lookup.
    let name = if cfg!(target_os = "windows") { "glslc.exe" } else { "glslc" };
    let probe = Command::new(name).arg("--version").output();
    if probe.is_ok() {
        return Some(PathBuf::from(name));
    }
    None
}

fn up_to_date(src: &Path, dst: &Path) -> bool {
    match (std::fs::metadata(src), std::fs::metadata(dst)) {
        (Ok(src_meta), Ok(dst_meta)) => match (src_meta.modified(), dst_meta.modified()) {
            (Ok(s), Ok(d)) => d >= s,
            _ => false,
        },
        _ => false,
    }
}
