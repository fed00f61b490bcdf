mod common;

use common::{collect, exception, native_library, plugins, request, runner, worker_exe};
use shot_engine::{
    EngineError, ExceptionKind, ExceptionRecord, NativePlugin, PluginSet, ResultValue,
};

#[tokio::test]
async fn test_exit_is_not_success_and_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path(), &["exit-or-succeed", "--exit-probability", "0.4"]).await;
    let shots = collect(&runner, request(&runner, 1).with_shots(100).with_processes(3))
        .await
        .unwrap();
    assert_eq!(shots.len(), 100);

    let mut n_success = 0;
    let mut n_exit = 0;
    for shot in &shots {
        let exited = shot.get("exit: Postselection failed");
        let succeeded = shot.get("success");
        assert!(exited.is_some() != succeeded.is_some(), "shot {}", shot.shot_id);
        if let Some(code) = exited {
            assert_eq!(code, &ResultValue::Int(1));
            n_exit += 1;
        } else {
            n_success += 1;
        }
    }
    assert_eq!(n_success + n_exit, 100);
    assert!(n_exit > 0 && n_success > 0);
}

#[tokio::test]
async fn test_panic_halts_run() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path(), &["panic-at", "--at", "5"]).await;
    let mut stream = runner
        .run_shots(request(&runner, 1).with_shots(10).with_processes(2))
        .await
        .unwrap();

    let mut delivered = Vec::new();
    let err = loop {
        match stream.next_shot().await {
            Some(Ok(shot)) => delivered.push(shot.shot_id),
            Some(Err(err)) => break err,
            None => panic!("run finished without the panic"),
        }
    };
    assert_eq!(delivered, [0, 1, 2, 3, 4]);

    let record = exception(err);
    assert_eq!(record.kind(), ExceptionKind::Panic);
    assert_eq!(record.message(), "Postselection failed");
    assert_eq!(record.code(), Some(1001));
    assert!(record.stdout().contains("shot 5: about to fail"), "{}", record.stdout());
    assert!(record.stderr().contains("shot 5: giving up"), "{}", record.stderr());

    assert!(stream.next_shot().await.is_none());
    assert!(stream.worker_exits().iter().all(|exit| exit.is_some()));
}

#[tokio::test]
async fn test_unparsed_panic_yields_shot_then_error() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path(), &["panic-at", "--at", "1"]).await;
    let mut stream = runner
        .run_shots(request(&runner, 1).with_shots(4).with_parse_results(false))
        .await
        .unwrap();

    let first = stream.next_shot().await.unwrap().unwrap();
    assert_eq!(first.get("USER:BOOL:ok"), Some(&ResultValue::Bool(true)));

    let panicked = stream.next_shot().await.unwrap().unwrap();
    let tags: Vec<&str> = panicked.iter().map(|(tag, _)| tag).collect();
    assert_eq!(tags.len(), 4);
    assert_eq!(tags[0], "EXIT:INT:Postselection failed");
    assert_eq!(tags[1], "_EXCEPTION:INT:Panic");
    assert!(tags[2].starts_with("_STDERR:INT:"));
    assert!(tags[3].starts_with("_STDOUT:INT:"));
    assert_eq!(panicked.entries[0].value, ResultValue::Int(1001));

    let err = stream.next_shot().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        EngineError::Exception(ExceptionRecord::Panic { code: 1001, .. })
    ));
    assert!(stream.next_shot().await.is_none());
}

#[tokio::test]
async fn test_truncated_exception_is_runtime_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path(), &["truncated-panic-at", "--at", "0"]).await;
    let err = collect(&runner, request(&runner, 1).with_shots(3)).await.unwrap_err();
    let record = exception(err);
    assert_eq!(record.kind(), ExceptionKind::RuntimeFailure);
    assert!(
        record
            .message()
            .starts_with("Incomplete exception encoding in shot results"),
        "{}",
        record.message()
    );
    assert!(record.message().contains("stderr path"));
    assert!(record.message().contains("Postselection failed"));
    assert_eq!(record.stdout(), "Corrupted stdout.");
    assert_eq!(record.stderr(), "Corrupted stderr.");
}

#[tokio::test]
async fn test_crash_mid_shot_is_runtime_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path(), &["crash-at", "--at", "2"]).await;
    let mut stream = runner.run_shots(request(&runner, 1).with_shots(5)).await.unwrap();
    assert!(stream.next_shot().await.unwrap().is_ok());
    assert!(stream.next_shot().await.unwrap().is_ok());

    let record = exception(stream.next_shot().await.unwrap().unwrap_err());
    assert_eq!(record.kind(), ExceptionKind::RuntimeFailure);
    assert_eq!(
        record.message(),
        "Worker terminated unexpectedly during shot 2 (exit code 3)"
    );
    assert!(record.stdout().contains("about to fail"));
}

#[tokio::test]
async fn test_corrupted_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let fake = dir.path().join("libruntime.so");
    std::fs::write(&fake, "definitely not a shared object\n").unwrap();
    let good = plugins();
    let plugins = PluginSet::new(
        good.simulator.clone(),
        NativePlugin::new(&fake).into_arc(),
        good.error_model.clone(),
    );

    let runner = runner(&dir.path().join("root"), &["measure"]).await;
    let err = collect(&runner, runner.request(plugins, 2).with_shots(10))
        .await
        .unwrap_err();
    let record = exception(err);
    assert_eq!(record.kind(), ExceptionKind::RuntimeFailure);
    assert!(
        record.stderr().contains("Failed to load runtime plugin"),
        "{}",
        record.stderr()
    );
}

#[tokio::test]
async fn test_worker_exiting_before_connect() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path(), &["no-such-program"]).await;
    let record = exception(collect(&runner, request(&runner, 1)).await.unwrap_err());
    assert_eq!(record.kind(), ExceptionKind::RuntimeFailure);
    assert!(record.message().contains("before connecting"), "{}", record.message());
    assert!(record.stderr().contains("no-such-program"), "{}", record.stderr());
}

#[tokio::test]
async fn test_missing_executable() {
    let dir = tempfile::tempdir().unwrap();
    let runner = shot_engine::ShotRunner::new(
        dir.path(),
        shot_engine::Executable::new(dir.path().join("missing")),
    )
    .await
    .unwrap();
    let record = exception(collect(&runner, request(&runner, 1)).await.unwrap_err());
    assert_eq!(record.kind(), ExceptionKind::RuntimeFailure);
    assert!(record.message().starts_with("Failed to spawn worker 0"));
    assert!(!record.stderr().is_empty());
}

#[tokio::test]
async fn test_mapped_library_passes_header_check() {
    assert!(shot_engine::plugin::check_native_library(&native_library()).is_ok());
    assert!(shot_engine::plugin::check_native_library(&worker_exe()).is_ok());
}

#[tokio::test]
async fn test_unloadable_plugin_fails_in_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    // right header, nothing behind it
    let fake = dir.path().join("libsimulator.so");
    let mut bytes = b"\x7fELF".to_vec();
    bytes.extend_from_slice(&[0; 60]);
    std::fs::write(&fake, bytes).unwrap();
    let good = plugins();
    let plugins = PluginSet::new(
        NativePlugin::new(&fake).into_arc(),
        good.runtime.clone(),
        good.error_model.clone(),
    );

    let runner = runner(&dir.path().join("root"), &["measure"]).await;
    let err = collect(&runner, runner.request(plugins, 2).with_shots(4).with_processes(2))
        .await
        .unwrap_err();
    let record = exception(err);
    assert_eq!(record.kind(), ExceptionKind::RuntimeFailure);
    assert!(record.message().contains("before connecting"), "{}", record.message());
    assert!(
        record.stderr().contains("Failed to load simulator plugin from"),
        "{}",
        record.stderr()
    );
}
