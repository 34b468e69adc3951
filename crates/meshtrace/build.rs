use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=csrc");
    println!("cargo::rerun-if-changed=build.rs");
    println!("cargo::rerun-if-env-changed=MESHTRACE_PTX");
    println!("cargo::rerun-if-env-changed=NVCC");

    // the host backend needs no device code
    if env::var_os("CARGO_FEATURE_OPTIX").is_none() {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let ptx = out_dir.join("meshtrace_device.ptx");

    // a prebuilt module skips nvcc entirely
    if let Ok(prebuilt) = env::var("MESHTRACE_PTX") {
        std::fs::copy(&prebuilt, &ptx)
            .unwrap_or_else(|e| panic!("failed to copy {prebuilt}: {e}"));
        return;
    }

    // set by optix-sys through its `links` key
    let optix_include = env::var("DEP_OPTIX_INCLUDE").expect("optix-sys did not export its include path");
    let cuda_include = env::var("DEP_OPTIX_CUDA_INCLUDE").expect("optix-sys did not export the CUDA include path");
    let nvcc = env::var("NVCC").unwrap_or_else(|_| "nvcc".to_string());

    let status = Command::new(&nvcc)
        .arg("--ptx")
        .arg("-O3")
        .arg("--use_fast_math")
        .arg("-std=c++17")
        .arg(format!("-I{optix_include}"))
        .arg(format!("-I{cuda_include}"))
        .arg("-Icsrc")
        .arg("csrc/meshtrace_device.cu")
        .arg("-o")
        .arg(&ptx)
        .status()
        .unwrap_or_else(|e| panic!("failed to run {nvcc}: {e}"));

    if !status.success() {
        panic!("{nvcc} failed to compile csrc/meshtrace_device.cu ({status})");
    }
}
