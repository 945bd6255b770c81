// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::{Path, PathBuf};

extern crate slang;

const CONVERT_SHADER: &str = "src/shaders/ycbcr_to_rgba.slang";

/// Each variant of the conversion shader, by output name. Both read a
/// two-plane image; the 16-bit variant unpacks MSB-aligned samples.
const CONVERT_VARIANTS: &[(&str, &[(&str, &str)])] = &[
    ("ycbcr_to_rgba_semiplanar.spv", &[]),
    ("ycbcr_to_rgba_semiplanar_16.spv", &[("HIGH_BIT_DEPTH", "1")]),
];

fn main() {
    let out_dir = std::env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .expect("OUT_DIR not set")
        .join("shaders");

    std::fs::create_dir_all(&out_dir).expect("failed to create shader directory");

    let mut session = slang::GlobalSession::new();
    for (name, defines) in CONVERT_VARIANTS {
        let spirv = compile_compute(&mut session, Path::new(CONVERT_SHADER), defines);
        std::fs::write(out_dir.join(name), spirv)
            .unwrap_or_else(|e| panic!("failed to write {}: {}", name, e));
    }

    println!("cargo::rerun-if-changed={}", CONVERT_SHADER);
}

fn compile_compute(
    session: &mut slang::GlobalSession,
    source: &Path,
    defines: &[(&str, &str)],
) -> Vec<u8> {
    let mut request = session.create_compile_request();
    request
        .set_codegen_target(slang::CompileTarget::Spirv)
        .set_optimization_level(slang::OptimizationLevel::Maximal)
        .set_target_profile(session.find_profile("glsl_460"));

    for &(name, value) in defines {
        request.add_preprocessor_define(name, value);
    }

    let source = source.to_str().expect("shader path isn't utf-8");
    let entry_point = request
        .add_translation_unit(slang::SourceLanguage::Slang, None)
        .add_source_file(source)
        .add_entry_point("main", slang::Stage::Compute);

    let program = request
        .compile()
        .unwrap_or_else(|_| panic!("failed to compile {}", source));

    program.get_entry_point_code(entry_point).to_vec()
}
