use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=MISSION_HOST_TEST_WORKERS");

    // Async integration tests run on as many workers as the machine has, at
    // least two so listener tasks and probes can make progress side by side.
    let workers = env::var("MISSION_HOST_TEST_WORKERS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get)
        .max(2);
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let macro_src = format!(
        "macro_rules! worker_test {{ ($name:ident, $body:block) => {{ #[tokio::test(flavor = \"multi_thread\", worker_threads = {workers})] async fn $name() $body }}; }}\n"
    );
    fs::write(out_dir.join("worker_test_macro.rs"), macro_src).expect("write worker test macro");
}
