//! Script runtime throughput benchmarks.
//!
//! - Compile: both passes plus Wasmtime compilation of the fixtures.
//! - Build: instantiation, object creation and field publishing.
//! - Frame: `Update` + `ScriptEnd` + `__collect` for a populated scene.
//! - Input: one guest callback round trip.
//!
//! Run with: `cargo bench --bench wasm_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lumen_scene::{InputEvent, InputSystem, KeyPhase, Modifiers, SceneObject};
use lumen_script::{compile_scripts, VirtualFileMap};
use lumen_wasm_host::{ImportPackage, ScriptRunner, WasmConfig};
use serde_json::json;

/// Load a script fixture from the tests/fixtures directory.
fn fixture(name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read fixture {}: {}", path.display(), e))
}

fn fixture_files() -> VirtualFileMap {
    ["spinner", "player", "follower"]
        .into_iter()
        .map(|name| (format!("scripts/{name}.lum"), fixture(&format!("{name}.lum"))))
        .collect()
}

/// `count` spinning cubes, each followed by a camera.
fn scene_packages(count: usize) -> Vec<ImportPackage> {
    let mut packages = Vec::with_capacity(count * 2);
    for i in 0..count {
        let cube = format!("cube{i}");
        let speed = json!({ "speed": 1.0 + i as f64 });
        packages.push(
            ImportPackage::new(&cube).with_component("Spinner", speed.as_object().cloned().unwrap_or_default()),
        );
        let follow = json!({
            "target": cube,
            "leader": { "sceneObjectId": cube, "component": "Spinner" },
        });
        packages.push(
            ImportPackage::new(format!("camera{i}"))
                .with_component("Follower", follow.as_object().cloned().unwrap_or_default()),
        );
    }
    packages
}

// ---------------------------------------------------------------------------
// Benchmark 1: Full compile pipeline
// ---------------------------------------------------------------------------

fn bench_compile(c: &mut Criterion) {
    let files = fixture_files();
    c.bench_function("compile_scripts", |b| {
        b.iter(|| {
            let compiled = compile_scripts(black_box(&files)).expect("fixtures should compile");
            black_box(compiled.bytecode.len());
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark 2: Build of 100 scene objects
// ---------------------------------------------------------------------------

fn bench_build(c: &mut Criterion) {
    let mut runner = ScriptRunner::new(WasmConfig::default()).expect("engine should start");
    runner.compile(&fixture_files()).expect("fixtures should compile");
    let packages = scene_packages(50);

    c.bench_function("build_100_scene_objects", |b| {
        b.iter(|| {
            runner.build(black_box(&packages)).expect("build should succeed");
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark 3: Frame with 100 scene objects, 50 bound
// ---------------------------------------------------------------------------

fn bench_frame(c: &mut Criterion) {
    let mut runner = ScriptRunner::new(WasmConfig::default()).expect("engine should start");
    let mut input = InputSystem::new();
    runner.compile(&fixture_files()).expect("fixtures should compile");
    runner.build(&scene_packages(50)).expect("build should succeed");
    for i in 0..50 {
        let mut cube = SceneObject::new(format!("cube{i}"));
        runner.bind(&mut cube).expect("bind should succeed");
    }
    runner.start(&mut input).expect("start should succeed");

    c.bench_function("frame_100_scene_objects", |b| {
        b.iter(|| {
            runner
                .frame(black_box(1.0 / 60.0), &mut input)
                .expect("frame should not trap");
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark 4: Input callback round trip
// ---------------------------------------------------------------------------

fn bench_input_callback(c: &mut Criterion) {
    let mut runner = ScriptRunner::new(WasmConfig::default()).expect("engine should start");
    let mut input = InputSystem::new();
    runner.compile(&fixture_files()).expect("fixtures should compile");
    runner
        .build(&[ImportPackage::new("hero").with_component("Player", Default::default())])
        .expect("build should succeed");
    runner.start(&mut input).expect("start should succeed");

    let press = InputEvent::Key {
        key: "Space".to_owned(),
        phase: KeyPhase::Press,
        modifiers: Modifiers::NONE,
    };
    c.bench_function("input_callback", |b| {
        b.iter(|| {
            runner
                .handle_input(black_box(&press), &mut input)
                .expect("callback should not trap");
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion groups and main
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_compile,
    bench_build,
    bench_frame,
    bench_input_callback,
);
criterion_main!(benches);
