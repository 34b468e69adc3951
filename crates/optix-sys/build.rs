use std::env;
use std::path::PathBuf;

fn cuda_dir() -> PathBuf {
    env::var("CUDA_PATH")
        .or_else(|_| env::var("CUDA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/local/cuda"))
}

fn main() {
    println!("cargo::rerun-if-env-changed=OPTIX_ROOT");
    println!("cargo::rerun-if-env-changed=CUDA_PATH");
    println!("cargo::rerun-if-env-changed=CUDA_HOME");
    println!("cargo::rerun-if-changed=wrapper.h");
    println!("cargo::rerun-if-changed=csrc/optix_stubs.c");

    let Ok(optix_root) = env::var("OPTIX_ROOT") else {
        panic!("OPTIX_ROOT must point at an OptiX 7 SDK install");
    };
    let optix_include_dir = PathBuf::from(optix_root).join("include");
    let cuda_dir = cuda_dir();
    let cuda_include_dir = cuda_dir.join("include");

    // pass include folders to dependents (the device program build needs them too)
    println!("cargo::metadata=include={}", optix_include_dir.display());
    println!("cargo::metadata=cuda_include={}", cuda_include_dir.display());

    // The OptiX entry points are inline functions dispatching through a function
    // table filled in by optixInit; the shim instantiates that table.
    cc::Build::new()
        .file("csrc/optix_stubs.c")
        .include(".")
        .include(&optix_include_dir)
        .include(&cuda_include_dir)
        .warnings(false)
        .compile("optix_stubs");

    // libcuda ships with the driver; the toolkit only has link stubs
    let lib_dir = if cuda_dir.join("lib64").exists() { "lib64" } else { "lib" };
    println!("cargo::rustc-link-search=native={}", cuda_dir.join(lib_dir).join("stubs").display());
    println!("cargo::rustc-link-search=native={}", cuda_dir.join(lib_dir).display());
    println!("cargo::rustc-link-lib=cuda");
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("linux") {
        println!("cargo::rustc-link-lib=dl");
    }

    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", optix_include_dir.display()))
        .clang_arg(format!("-I{}", cuda_include_dir.display()))
        .allowlist_function("optixsys_.*")
        .allowlist_function("cu(Init|DeviceGet|DevicePrimaryCtx.*|CtxGetCurrent|CtxSetCurrent|CtxSynchronize|GetErrorString|Mem.*)")
        .allowlist_type("Optix.*")
        .allowlist_type("CU.*")
        .allowlist_var("OPTIX_.*")
        .derive_default(true)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate()
        .expect("Unable to generate bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}
