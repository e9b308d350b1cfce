use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir()
        .join("qsnap-tests")
        .join(format!("{}-{}", prefix, nonce));
    std::fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

fn write_temp_file(prefix: &str, contents: &str) -> PathBuf {
    let path = temp_dir(prefix).join("capture.yaml");
    std::fs::write(&path, contents).expect("Failed to write temp file");
    path
}

fn qsnap(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_qsnap"))
        .args(args)
        .output()
        .expect("Failed to execute qsnap")
}

#[test]
fn test_cli_help_lists_subcommands() {
    let output = qsnap(&["--help"]);
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for sub in ["capture", "cpu", "raw2dmp", "store"] {
        assert!(help.contains(sub), "missing {} in help", sub);
    }
}

#[test]
fn test_cli_raw2dmp_two_pages() {
    let dir = temp_dir("raw2dmp");
    let raw = dir.join("raw");
    let image: Vec<u8> = (0..8192u32).map(|i| (i / 4096) as u8 + 1).collect();
    std::fs::write(&raw, &image).unwrap();

    let output = qsnap(&["raw2dmp", raw.to_str().unwrap()]);
    assert!(output.status.success());

    let dump = std::fs::read(dir.join("mem.dmp")).unwrap();
    assert_eq!(dump.len(), 16441);
    assert_eq!(&dump[0..8], b"PAGEDU64");
    assert_eq!(&dump[8192..8200], b"SDMPDUMP");
    assert_eq!(dump[8248], 0xff);
    assert_eq!(&dump[8249..], &image[..]);
    assert!(!raw.exists());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_raw2dmp_refuses_dump_name() {
    let dir = temp_dir("raw2dmp-name");
    let raw = dir.join("mem.dmp");
    std::fs::write(&raw, vec![0u8; 4096]).unwrap();

    let output = qsnap(&["raw2dmp", raw.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2)); // EXIT_CONFIG_ERROR
    assert_eq!(std::fs::metadata(&raw).unwrap().len(), 4096);
}

#[test]
fn test_cli_raw2dmp_empty_image_fails() {
    let dir = temp_dir("raw2dmp-empty");
    let raw = dir.join("raw");
    std::fs::write(&raw, vec![0u8; 100]).unwrap();

    let output = qsnap(&["raw2dmp", raw.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1)); // EXIT_FAILURE
    assert!(!dir.join("mem.dmp").exists());
}

#[test]
fn test_cli_store_set_and_show() {
    let dir = temp_dir("store");
    let store = dir.join("symbol-store.json");
    let store_arg = store.to_str().unwrap();

    let output = qsnap(&["store", "--store", store_arg, "set", "tiffinfo=0x555555554000"]);
    assert!(output.status.success());
    let output = qsnap(&["store", "--store", store_arg, "set", "entry_syscall=18446744071593525248", "note=hello"]);
    assert!(output.status.success());

    let output = qsnap(&["store", "--store", store_arg, "show"]);
    assert!(output.status.success());
    let shown: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(shown["tiffinfo"], "0x555555554000");
    assert_eq!(shown["entry_syscall"], "0xffffffff81e00000");
    assert_eq!(shown["note"], "hello");

    let output = qsnap(&["store", "--store", store_arg, "set", "broken"]);
    assert_eq!(output.status.code(), Some(2));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_capture_missing_config() {
    let output = qsnap(&["capture", "--config", "/nonexistent/qsnap/capture.yaml"]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(2)); // EXIT_CONFIG_ERROR
}

#[test]
fn test_cli_capture_invalid_config() {
    let config = write_temp_file(
        "capture-invalid",
        r#"
schema_version: "1.0"
target:
  name: "tiff"
  program: "tiffinfo"
  breakpoint: "0x555555555189"
  base: "0x555555554000"
  check_name: false
  hits_required: 0
"#,
    );
    let output = qsnap(&["capture", "--config", config.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_cpu_requires_host_section() {
    let config = write_temp_file(
        "cpu-no-host",
        r#"
schema_version: "1.0"
target:
  name: "tiff"
  program: "tiffinfo"
  breakpoint: 0x1189
  base: 0x0
  check_name: false
"#,
    );
    let output = qsnap(&["cpu", "--config", config.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_capture_unreachable_guest() {
    let dir = temp_dir("capture-unreachable");
    // Grab a free port and release it so nothing is listening there.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = dir.join("capture.yaml");
    std::fs::write(
        &config,
        format!(
            r#"
schema_version: "1.0"
target:
  name: "tiff"
  program: "tiffinfo"
  breakpoint: 0x1189
  base: 0x0
  check_name: false
targets_root: "{root}"
work_dir: "{work}"
guest_gdb: "127.0.0.1:{port}"
"#,
            root = dir.join("targets").display(),
            work = dir.join("work").display(),
            port = port
        ),
    )
    .unwrap();

    let output = qsnap(&["capture", "--config", config.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1)); // EXIT_FAILURE

    let _ = std::fs::remove_dir_all(&dir);
}
