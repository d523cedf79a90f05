//! Tests for the process engine launcher against real child processes.

use std::time::Duration;

use enginepool_worker::config::EngineConfig;
use enginepool_worker::engine::{EngineLauncher, LaunchOptions, ProcessLauncher};
use enginepool_worker::error::WorkerError;

/// Launcher running `sh -c <script>`; the generated flags land in `$1..`
/// (`$2` is the port, `$4` the path).
fn shell_launcher(script: &str) -> ProcessLauncher {
    ProcessLauncher::new(EngineConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "engine".to_string()],
        startup_timeout_ms: 2_000,
        close_grace_ms: 2_000,
        ..EngineConfig::default()
    })
}

fn options(path: &str) -> LaunchOptions {
    LaunchOptions {
        port: 4555,
        headless: true,
        path: path.to_string(),
    }
}

#[tokio::test]
async fn test_launch_reads_advertised_endpoint() {
    let launcher =
        shell_launcher(r#"echo "booting"; echo "Listening on ws://127.0.0.1:$2$4"; exec sleep 30"#);

    let mut engine = launcher.launch(&options("/abc")).await.unwrap();
    assert_eq!(engine.endpoint(), "ws://127.0.0.1:4555/abc");

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_launch_passes_headless_flag() {
    let launcher = shell_launcher(r#"echo "ws://127.0.0.1:$2/$5"; exec sleep 30"#);

    let mut engine = launcher.launch(&options("/p")).await.unwrap();
    assert_eq!(engine.endpoint(), "ws://127.0.0.1:4555/--headless");
    engine.close().await.unwrap();

    let mut engine = launcher
        .launch(&LaunchOptions {
            headless: false,
            ..options("/p")
        })
        .await
        .unwrap();
    assert_eq!(engine.endpoint(), "ws://127.0.0.1:4555/");
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_close_terminates_engine() {
    let launcher = shell_launcher(r#"echo "ws://127.0.0.1:$2$4"; exec sleep 30"#);
    let mut engine = launcher.launch(&options("/x")).await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(1), engine.close()).await;
    assert!(matches!(closed, Ok(Ok(()))), "SIGTERM should stop the engine");
}

#[tokio::test]
async fn test_close_kills_engine_ignoring_sigterm() {
    let launcher = ProcessLauncher::new(EngineConfig {
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            r#"trap '' TERM; echo "ws://127.0.0.1:$2$4"; exec sleep 30"#.to_string(),
            "engine".to_string(),
        ],
        startup_timeout_ms: 2_000,
        close_grace_ms: 100,
        ..EngineConfig::default()
    });
    let mut engine = launcher.launch(&options("/x")).await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), engine.close()).await;
    assert!(matches!(closed, Ok(Ok(()))), "close should escalate to kill");
}

#[tokio::test]
async fn test_close_after_engine_exited() {
    let launcher = shell_launcher(r#"echo "ws://127.0.0.1:$2$4""#);
    let mut engine = launcher.launch(&options("/x")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_exit_before_endpoint_fails() {
    let launcher = shell_launcher("echo 'no endpoint here'; exit 3");

    let result = launcher.launch(&options("/x")).await;
    assert!(matches!(result, Err(WorkerError::EngineLaunch(_))));
}

#[tokio::test]
async fn test_silent_engine_times_out() {
    let launcher = ProcessLauncher::new(EngineConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "exec sleep 30".to_string()],
        startup_timeout_ms: 200,
        ..EngineConfig::default()
    });

    let started = tokio::time::Instant::now();
    let result = launcher.launch(&options("/x")).await;
    assert!(matches!(result, Err(WorkerError::EngineLaunch(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_engine_closing_output_times_out() {
    let launcher = ProcessLauncher::new(EngineConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "exec >&-; exec sleep 30".to_string()],
        startup_timeout_ms: 200,
        ..EngineConfig::default()
    });

    let result = tokio::time::timeout(Duration::from_secs(5), launcher.launch(&options("/x")))
        .await
        .expect("launch should give up once the startup timeout elapses");
    match result {
        Err(WorkerError::EngineLaunch(msg)) => assert!(msg.contains("200ms")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("launch should fail"),
    }
}

#[tokio::test]
async fn test_missing_command_fails() {
    let launcher = ProcessLauncher::new(EngineConfig {
        command: "/nonexistent/engine-binary".to_string(),
        args: Vec::new(),
        ..EngineConfig::default()
    });

    let result = launcher.launch(&options("/x")).await;
    match result {
        Err(WorkerError::EngineLaunch(msg)) => assert!(msg.contains("failed to spawn")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("launch should fail"),
    }
}
