/// End-to-end tests for the coordinator (SQL and Python sandboxes)
#[cfg(test)]
mod sql_session_tests {
    use querybox::grading::sha256_hex;
    use querybox::{
        Coordinator, DumpStore, MemoryCatalog, MemoryDumpStore, Mode, Problem, SandboxConfig,
        SandboxError, SqlValue,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn dumps() -> Arc<dyn DumpStore> {
        Arc::new(
            MemoryDumpStore::new()
                .with("ordered", "CREATE TABLE t(x int); INSERT INTO t VALUES (1),(2);")
                .with("reversed", "CREATE TABLE t(x int); INSERT INTO t VALUES (2),(1);")
                .with("broken", "CREATE TABL t(x int);"),
        )
    }

    fn problem(id: u64, dump: &str) -> Problem {
        Problem {
            id,
            mode: Mode::Sql,
            database_dump_id: dump.to_string(),
            aux_files: BTreeMap::new(),
            env: BTreeMap::new(),
            solution_hash: Some(sha256_hex("[[1],[2]]")),
            golden: None,
        }
    }

    #[tokio::test]
    async fn test_correct_sql_submission() {
        querybox::logging::init_logging(false);
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        let mut scenario = problem(1, "ordered");
        scenario.golden = Some("SELECT x FROM t ORDER BY x".to_string());
        coordinator.open_problem(scenario);

        let verdict = coordinator
            .submit_to_verdict("SELECT x FROM t ORDER BY x")
            .await
            .expect("Submit should not fail");
        assert!(verdict.is_correct);
        let expected_rows = vec![vec![SqlValue::Integer(1)], vec![SqlValue::Integer(2)]];
        assert_eq!(verdict.result.rows, expected_rows);
        assert_eq!(verdict.result.expected.map(|e| e.rows), Some(expected_rows));
    }

    #[tokio::test]
    async fn test_unordered_submission_is_incorrect() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem(2, "reversed"));

        let correct = coordinator
            .submit("SELECT x FROM t")
            .await
            .expect("Submit should not fail");
        assert!(!correct, "Storage order differs from the expected order");
        assert!(coordinator.submit("SELECT x FROM t ORDER BY x").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_error_keeps_sandbox() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem(3, "ordered"));

        let err = coordinator.run("SELEC x FROM t").await.unwrap_err();
        assert!(matches!(err, SandboxError::Query { .. }));
        assert!(coordinator.has_sandbox(), "Query errors are not fatal");

        let result = coordinator.run("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(result.rows, vec![vec![SqlValue::Integer(2)]]);
    }

    #[tokio::test]
    async fn test_state_persists_within_one_sql_sandbox() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem(4, "ordered"));

        coordinator.run("INSERT INTO t VALUES (3)").await.unwrap();
        let result = coordinator.run("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(result.rows, vec![vec![SqlValue::Integer(3)]]);
    }

    #[tokio::test]
    async fn test_switching_problem_starts_fresh() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem(5, "ordered"));
        coordinator.run("DELETE FROM t").await.unwrap();

        coordinator.open_problem(problem(6, "ordered"));
        assert!(!coordinator.has_sandbox());
        let result = coordinator.run("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(result.rows, vec![vec![SqlValue::Integer(2)]]);
    }

    #[tokio::test]
    async fn test_broken_dump_is_fatal() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem(7, "broken"));

        let err = coordinator.run("SELECT 1").await.unwrap_err();
        assert!(matches!(err, SandboxError::DumpLoad { ref dump_id, .. } if dump_id == "broken"));
        assert!(!coordinator.has_sandbox(), "Dump failures discard the sandbox");

        let result = coordinator.run_to_result("SELECT 1").await;
        assert!(!result.is_success());
        assert!(result.error_message.unwrap().contains("broken"));
        let err = coordinator.submit("SELECT 1").await.unwrap_err();
        assert!(matches!(err, SandboxError::DumpLoad { ref dump_id, .. } if dump_id == "broken"));
        let verdict = coordinator.submit_to_verdict("SELECT 1").await.unwrap();
        assert!(!verdict.is_correct);
    }

    #[tokio::test]
    async fn test_golden_result_travels_with_run() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        let mut with_golden = problem(8, "ordered");
        with_golden.golden = Some("SELECT max(x) FROM t".to_string());
        coordinator.open_problem(with_golden);

        let result = coordinator.run("SELECT min(x) FROM t").await.unwrap();
        assert_eq!(result.rows, vec![vec![SqlValue::Integer(1)]]);
        assert_eq!(
            result.expected.map(|e| e.rows),
            Some(vec![vec![SqlValue::Integer(2)]])
        );
    }

    #[tokio::test]
    async fn test_load_problem_from_catalog() {
        let mut catalog = MemoryCatalog::new();
        catalog.insert(problem(9, "ordered"));

        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        let loaded = coordinator.load_problem(&catalog, 9).expect("Problem should load");
        assert_eq!(loaded.database_dump_id, "ordered");
        assert!(matches!(
            coordinator.load_problem(&catalog, 10),
            Err(SandboxError::Store { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_without_problem() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        assert!(matches!(
            coordinator.run("SELECT 1").await,
            Err(SandboxError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_terminates_sandbox() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem(11, "ordered"));
        coordinator.run("SELECT 1").await.unwrap();
        assert!(coordinator.has_sandbox());

        coordinator.close();
        assert!(!coordinator.has_sandbox());
        assert!(coordinator.problem().is_none());
    }
}

#[cfg(test)]
mod python_session_tests {
    use querybox::grading::sha256_hex;
    use querybox::{
        Coordinator, DumpStore, MemoryDumpStore, Mode, Problem, SandboxConfig, SandboxError,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn dumps() -> Arc<dyn DumpStore> {
        Arc::new(
            MemoryDumpStore::new()
                .with("shop", "CREATE TABLE items(name text, price real); INSERT INTO items VALUES ('pen', 1.5), ('ink', 4.0);")
                .with("broken", "CREATE TABL t(x int);"),
        )
    }

    fn problem(dump: &str, expected_stdout: &str) -> Problem {
        Problem {
            id: 100,
            mode: Mode::Python,
            database_dump_id: dump.to_string(),
            aux_files: BTreeMap::new(),
            env: BTreeMap::new(),
            solution_hash: Some(sha256_hex(expected_stdout)),
            golden: None,
        }
    }

    const SELECT_ONE: &str = r#"
import psycopg2
conn = psycopg2.connect("dbname=shop")
cur = conn.cursor()
cur.execute("SELECT 1")
print(cur.fetchone())
"#;

    #[tokio::test]
    async fn test_bridge_round_trip_and_grading() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem("shop", "(1,)\n"));

        let verdict = coordinator
            .submit_to_verdict(SELECT_ONE)
            .await
            .expect("Submit should not fail");
        assert_eq!(verdict.result.stdout, "(1,)\n");
        assert!(verdict.is_correct);
    }

    #[tokio::test]
    async fn test_each_run_sees_a_fresh_database() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem("shop", ""));

        let code = r#"
import psycopg2
cur = psycopg2.connect().cursor()
cur.execute("DELETE FROM items WHERE name = %s", ("pen",))
cur.execute("SELECT count(*) FROM items")
print(cur.fetchone()[0])
"#;
        assert_eq!(coordinator.run(code).await.unwrap().stdout, "1\n");
        assert_eq!(coordinator.run(code).await.unwrap().stdout, "1\n");
    }

    #[tokio::test]
    async fn test_guest_exception_discards_python_sandbox() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem("shop", ""));

        let result = coordinator
            .run_to_result("print('partial')\nraise ValueError('boom')\n")
            .await;
        assert!(!result.is_success());
        assert_eq!(result.stdout, "partial\n");
        let message = result.error_message.expect("Error message should be set");
        assert!(message.starts_with("partial\n"));
        assert!(message.contains("boom"));
        assert!(!coordinator.has_sandbox());

        assert_eq!(coordinator.run(SELECT_ONE).await.unwrap().stdout, "(1,)\n");
    }

    #[tokio::test]
    async fn test_keeping_python_sandbox_after_error() {
        let config = SandboxConfig {
            discard_python_after_error: false,
            ..Default::default()
        };
        let mut coordinator = Coordinator::new(config, dumps());
        coordinator.open_problem(problem("shop", ""));

        assert!(coordinator.run("1/0").await.is_err());
        assert!(coordinator.has_sandbox());
        assert_eq!(coordinator.run(SELECT_ONE).await.unwrap().stdout, "(1,)\n");
    }

    #[tokio::test]
    async fn test_failed_python_submission_returns_error() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem("shop", ""));

        let err = coordinator
            .submit("print('partial')\nraise ValueError('boom')\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Interpreter { .. }));
        assert_eq!(err.partial_stdout(), Some("partial\n"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_problem_env_and_files_reach_guest() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        let mut scenario = problem("shop", "");
        scenario.env.insert("REGION".to_string(), "eu".to_string());
        scenario
            .aux_files
            .insert("notes.txt".to_string(), "hello".to_string());
        coordinator.open_problem(scenario);

        let code = "import os\nprint(os.environ['REGION'], open('notes.txt').read())\n";
        assert_eq!(coordinator.run(code).await.unwrap().stdout, "eu hello\n");
    }

    #[tokio::test]
    async fn test_python_dump_failure() {
        let mut coordinator = Coordinator::new(SandboxConfig::default(), dumps());
        coordinator.open_problem(problem("broken", ""));

        let err = coordinator.run(SELECT_ONE).await.unwrap_err();
        assert!(matches!(err, SandboxError::DumpLoad { .. }));
        assert!(!coordinator.has_sandbox());
    }

    #[tokio::test]
    async fn test_oversized_result_fails_run() {
        let config = SandboxConfig {
            buffer_size: 512,
            ..Default::default()
        };
        let mut coordinator = Coordinator::new(config, dumps());
        coordinator.open_problem(problem("shop", ""));

        let code = r#"
import psycopg2
cur = psycopg2.connect().cursor()
try:
    cur.execute("WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1000) SELECT i FROM n")
except Exception:
    pass
print("swallowed")
"#;
        let result = coordinator.run_to_result(code).await;
        assert!(!result.is_success());
        assert!(result
            .error_message
            .expect("Error message should be set")
            .contains("Result too large for buffer"));
    }

    #[tokio::test]
    async fn test_execution_timeout_terminates_sandbox() {
        let config = SandboxConfig {
            execution_timeout_ms: Some(300),
            ..Default::default()
        };
        let mut coordinator = Coordinator::new(config, dumps());
        coordinator.open_problem(problem("shop", ""));

        let err = coordinator.run("import time\ntime.sleep(5)\n").await.unwrap_err();
        assert_eq!(err, SandboxError::Timeout { millis: 300 });
        assert!(!coordinator.has_sandbox());
    }
}
