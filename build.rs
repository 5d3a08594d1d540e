//! Build script for stbplayer
//!
//! With the `ffmpeg` feature enabled, probe for the FFmpeg development
//! libraries and print install hints when some are missing. Linking is
//! handled by ffmpeg-sys-next.

use std::env;

const FFMPEG_LIBRARIES: [&str; 5] = ["libavcodec", "libavformat", "libavutil", "libswscale", "libswresample"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");

    if env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }
    if env::var_os("FFMPEG_DIR").is_some() {
        println!("cargo:warning=Using FFmpeg from FFMPEG_DIR");
        return;
    }

    let missing: Vec<&str> = FFMPEG_LIBRARIES
        .iter()
        .copied()
        .filter(|lib| pkg_config::Config::new().cargo_metadata(false).probe(lib).is_err())
        .collect();

    if !missing.is_empty() {
        let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
        print_install_hints(&target_os, &missing);
    }
}

/// Explain how to get the missing FFmpeg libraries
fn print_install_hints(target_os: &str, missing: &[&str]) {
    println!("cargo:warning=FFmpeg libraries not found via pkg-config: {}", missing.join(", "));
    match target_os {
        "linux" => {
            println!("cargo:warning=  Debian/Ubuntu: sudo apt install libavcodec-dev libavformat-dev libavutil-dev libswscale-dev libswresample-dev");
            println!("cargo:warning=  Buildroot/Yocto: enable the ffmpeg package with swscale and swresample");
        }
        "macos" => println!("cargo:warning=  Run: brew install ffmpeg"),
        _ => println!("cargo:warning=  Set FFMPEG_DIR to an FFmpeg install prefix"),
    }
}
