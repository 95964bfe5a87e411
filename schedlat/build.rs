use std::{
    env,
    path::PathBuf,
    process::{Command, Stdio},
};

const EBPF_CRATE_DIR: &str = "../schedlat-ebpf";
const EBPF_BINARY: &str = "schedlat";

fn bpf_target(arch: &str) -> &'static str {
    match arch {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    }
}

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed={}/src", EBPF_CRATE_DIR);
    println!("cargo:rerun-if-changed=../schedlat-common/src");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let target = bpf_target(&arch);

    // Separate target directory so the nested build does not wait on our lock.
    let ebpf_target_dir = out_dir.join("ebpf-target");

    // Go through the rustup `cargo` proxy (not `$CARGO`, which is pinned to the
    // outer toolchain) so that `RUSTUP_TOOLCHAIN=nightly` takes effect.
    let status = Command::new("cargo")
        .current_dir(EBPF_CRATE_DIR)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", target),
            "-Z",
            "build-std=core",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .expect("Failed to execute cargo command");

    if !status.success() {
        panic!("Failed to build eBPF program");
    }

    let ebpf_binary = ebpf_target_dir.join(format!("{}/release/{}", target, EBPF_BINARY));
    std::fs::copy(&ebpf_binary, out_dir.join(EBPF_BINARY))
        .expect("Failed to copy eBPF object file");
}
