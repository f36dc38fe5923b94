use script_runner::staging::FileStaging;
use script_runner::{LocalStorage, Storage};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

struct Fixture {
    _temp_dir: TempDir,
    storage: Arc<LocalStorage>,
    staging: FileStaging,
    working_dir: std::path::PathBuf,
    output_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let working_dir = temp_dir.path().join("work");
    let output_dir = working_dir.join("outputs");
    fs::create_dir_all(&output_dir).unwrap();
    let storage = Arc::new(LocalStorage::new(temp_dir.path().join("storage")));
    let staging = FileStaging::new(&working_dir, &output_dir, storage.clone(), "exec-1");
    Fixture {
        _temp_dir: temp_dir,
        storage,
        staging,
        working_dir,
        output_dir,
    }
}

async fn fetch_bytes(storage: &LocalStorage, handle: &str) -> Vec<u8> {
    let mut reader = storage.fetch(handle).await.unwrap();
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    bytes
}

#[tokio::test]
async fn traversing_input_is_rejected_before_anything_is_written() {
    let f = fixture();
    let inputs = BTreeMap::from([
        ("a.txt".to_string(), "fine".to_string()),
        ("../escape.txt".to_string(), "nope".to_string()),
    ]);

    let err = f.staging.stage_inputs(&inputs).await.unwrap_err();

    assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST");
    assert!(!f.working_dir.join("a.txt").exists());
    assert!(!f.working_dir.parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn dotfiles_and_nested_inputs_are_staged() {
    let f = fixture();
    let inputs = BTreeMap::from([
        (".env".to_string(), "A=1".to_string()),
        ("conf/app.yml".to_string(), "debug: true".to_string()),
    ]);

    let staged = f.staging.stage_inputs(&inputs).await.unwrap();

    assert_eq!(staged.len(), 2);
    assert_eq!(fs::read_to_string(f.working_dir.join(".env")).unwrap(), "A=1");
    assert_eq!(
        fs::read_to_string(f.working_dir.join("conf/app.yml")).unwrap(),
        "debug: true"
    );
}

#[tokio::test]
async fn storage_handles_are_downloaded_as_inputs() {
    let f = fixture();
    let payload = vec![0u8, 159, 146, 150, 255];
    let handle = f
        .storage
        .store("seed/blob.bin", &mut payload.as_slice())
        .await
        .unwrap();

    let inputs = BTreeMap::from([("data/blob.bin".to_string(), handle)]);
    f.staging.stage_inputs(&inputs).await.unwrap();

    assert_eq!(fs::read(f.working_dir.join("data/blob.bin")).unwrap(), payload);
}

#[tokio::test]
async fn missing_storage_input_fails() {
    let f = fixture();
    let inputs = BTreeMap::from([(
        "gone.txt".to_string(),
        "storage:///nothing/here".to_string(),
    )]);

    let err = f.staging.stage_inputs(&inputs).await.unwrap_err();

    assert_eq!(err.code(), "SCRIPT_RUNNER_STORAGE");
}

#[tokio::test]
async fn output_dir_contents_round_trip_through_storage() {
    let f = fixture();
    let bytes = b"line one\nline two\n\x00binary tail".to_vec();
    fs::create_dir_all(f.output_dir.join("nested")).unwrap();
    fs::write(f.output_dir.join("report.txt"), &bytes).unwrap();
    fs::write(f.output_dir.join("nested/deep.txt"), "deep").unwrap();

    let uploaded = f
        .staging
        .collect_outputs(&[], &[], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(
        uploaded.keys().collect::<Vec<_>>(),
        vec!["nested/deep.txt", "report.txt"]
    );
    assert_eq!(fetch_bytes(&f.storage, &uploaded["report.txt"]).await, bytes);
    assert_eq!(
        fetch_bytes(&f.storage, &uploaded["nested/deep.txt"]).await,
        b"deep"
    );
}

#[tokio::test]
async fn declared_files_and_dirs_are_keyed_by_their_paths() {
    let f = fixture();
    fs::create_dir_all(f.working_dir.join("build/lib")).unwrap();
    fs::write(f.working_dir.join("build/app.bin"), "app").unwrap();
    fs::write(f.working_dir.join("build/lib/core.so"), "core").unwrap();
    fs::write(f.working_dir.join("summary-7.json"), "{}").unwrap();

    let vars = BTreeMap::from([("run".to_string(), "7".to_string())]);
    let uploaded = f
        .staging
        .collect_outputs(
            &["summary-{{ run }}.json".to_string(), "absent.txt".to_string()],
            &["build/".to_string()],
            &vars,
        )
        .await
        .unwrap();

    assert_eq!(
        uploaded.keys().collect::<Vec<_>>(),
        vec!["build/app.bin", "build/lib/core.so", "summary-7.json"]
    );
    assert!(uploaded.values().all(|handle| handle.starts_with("storage:///exec-1/")));
}

#[tokio::test]
async fn files_are_uploaded_once_even_when_declared_twice() {
    let f = fixture();
    fs::write(f.output_dir.join("result.csv"), "a,b").unwrap();

    let uploaded = f
        .staging
        .collect_outputs(&["outputs/result.csv".to_string()], &[], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(uploaded.len(), 1);
    assert!(uploaded.contains_key("outputs/result.csv"));
}

#[tokio::test]
async fn unknown_placeholder_is_rejected() {
    let f = fixture();

    let err = f
        .staging
        .collect_outputs(&["{{ missing }}.txt".to_string()], &[], &BTreeMap::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST");
}

#[tokio::test]
async fn absolute_outputs_must_stay_in_working_dir() {
    let f = fixture();

    let err = f
        .staging
        .collect_outputs(&["/etc/passwd".to_string()], &[], &BTreeMap::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST");
}

#[tokio::test]
async fn declared_output_keeps_its_bytes_when_output_dir_reuses_the_name() {
    let f = fixture();
    fs::write(f.working_dir.join("a.txt"), "declared").unwrap();
    fs::write(f.output_dir.join("a.txt"), "auto").unwrap();
    fs::write(f.output_dir.join("b.txt"), "other").unwrap();

    let uploaded = f
        .staging
        .collect_outputs(&["a.txt".to_string()], &[], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(
        uploaded.keys().collect::<Vec<_>>(),
        vec!["a.txt", "b.txt"]
    );
    assert_eq!(fetch_bytes(&f.storage, &uploaded["a.txt"]).await, b"declared");
    assert_eq!(fetch_bytes(&f.storage, &uploaded["b.txt"]).await, b"other");
}

#[tokio::test]
async fn objects_are_named_by_their_path_in_the_working_dir() {
    let f = fixture();
    fs::write(f.working_dir.join("a.txt"), "top").unwrap();
    fs::create_dir_all(f.working_dir.join("outputs")).unwrap();
    fs::write(f.output_dir.join("a.txt"), "nested").unwrap();

    let uploaded = f
        .staging
        .collect_outputs(
            &["a.txt".to_string()],
            &["outputs".to_string()],
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(uploaded["a.txt"], "storage:///exec-1/a.txt");
    assert_eq!(uploaded["outputs/a.txt"], "storage:///exec-1/outputs/a.txt");
    assert_eq!(fetch_bytes(&f.storage, &uploaded["a.txt"]).await, b"top");
    assert_eq!(
        fetch_bytes(&f.storage, &uploaded["outputs/a.txt"]).await,
        b"nested"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_leaving_the_working_dir_are_never_uploaded() {
    use std::os::unix::fs::symlink;

    let f = fixture();
    let outside = f.working_dir.parent().unwrap().join("host");
    fs::create_dir_all(&outside).unwrap();
    fs::write(outside.join("secret.txt"), "TOP SECRET").unwrap();

    symlink(outside.join("secret.txt"), f.working_dir.join("out.txt")).unwrap();
    symlink(&outside, f.working_dir.join("linked")).unwrap();
    symlink(outside.join("secret.txt"), f.output_dir.join("leak.txt")).unwrap();
    symlink(&outside, f.output_dir.join("leak-dir")).unwrap();
    fs::write(f.output_dir.join("real.txt"), "fine").unwrap();

    let uploaded = f
        .staging
        .collect_outputs(
            &["out.txt".to_string(), "linked/secret.txt".to_string()],
            &["linked".to_string()],
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(uploaded.keys().collect::<Vec<_>>(), vec!["real.txt"]);
    for handle in uploaded.values() {
        assert_ne!(fetch_bytes(&f.storage, handle).await, b"TOP SECRET");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_output_dir_is_not_walked() {
    use std::os::unix::fs::symlink;

    let f = fixture();
    let outside = f.working_dir.parent().unwrap().join("elsewhere");
    fs::create_dir_all(&outside).unwrap();
    fs::write(outside.join("private.key"), "key material").unwrap();
    fs::remove_dir(&f.output_dir).unwrap();
    symlink(&outside, &f.output_dir).unwrap();

    let uploaded = f
        .staging
        .collect_outputs(&[], &[], &BTreeMap::new())
        .await
        .unwrap();

    assert!(uploaded.is_empty());
}
