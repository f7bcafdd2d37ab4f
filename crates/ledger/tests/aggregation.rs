use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use transit_contracts::{
    IntakeDecision, IssueType, LineStatus, NewMetroLine, NewStation, StatsWindow,
};
use transit_ledger::{LedgerError, TransitLedger};
use transit_policy::ValidatedReport;

fn test_db_url() -> Option<String> {
    std::env::var("TRANSIT_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

struct TestDb {
    admin: sqlx::PgPool,
    schema: String,
    ledger: TransitLedger,
}

impl TestDb {
    async fn start(db_url: &str) -> Self {
        let schema = format!("transit_test_{}", ulid::Ulid::new().to_string().to_lowercase());

        let admin = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .expect("DB connect should succeed");

        sqlx::query(&format!("CREATE SCHEMA {}", schema))
            .execute(&admin)
            .await
            .expect("create schema should succeed");

        let ledger = TransitLedger::connect_and_migrate(
            &schema_db_url(db_url, &schema),
            4,
            Duration::from_secs(5),
        )
        .await
        .expect("ledger init should succeed");

        Self {
            admin,
            schema,
            ledger,
        }
    }

    async fn finish(self) {
        self.ledger.close().await;
        let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await;
        self.admin.close().await;
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
        .expect("timestamp should parse")
        .with_timezone(&Utc)
}

fn report(line_id: i64, issue_type: IssueType) -> ValidatedReport {
    ValidatedReport {
        line_id,
        station_id: None,
        issue_type,
        description: None,
        status: transit_policy::infer_status(issue_type),
    }
}

async fn create_line(ledger: &TransitLedger, code: &str) -> i64 {
    let (line, status) = ledger
        .create_line(
            &NewMetroLine {
                name: format!("Linha {code}"),
                code: code.to_string(),
                color: "#0255a5".to_string(),
            },
            t0() - TimeDelta::days(1),
        )
        .await
        .expect("create line should succeed");
    assert_eq!(status.status, LineStatus::Normal);
    assert!(status.is_current);
    line.id
}

async fn current_count(db: &TestDb, line_id: i64) -> usize {
    db.ledger
        .status_history(line_id, 100)
        .await
        .expect("history should load")
        .iter()
        .filter(|record| record.is_current)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn intake_denies_fourth_submission_and_recovers_after_window() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping intake test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let ip = "10.0.0.1";

    for minutes in [0, 1, 2] {
        let now = t0() + TimeDelta::minutes(minutes);
        assert_eq!(
            db.ledger.check_intake(ip, now).await.expect("check should succeed"),
            IntakeDecision::Allowed
        );
        let record = db
            .ledger
            .record_submission(ip, now)
            .await
            .expect("record should succeed");
        assert_eq!(record.ip_address, ip);
        assert_eq!(record.submitted_at, now);
    }

    let denied = db
        .ledger
        .check_intake(ip, t0() + TimeDelta::minutes(10))
        .await
        .expect("check should succeed");
    assert_eq!(denied, IntakeDecision::Denied { count: 3 });

    let other = db
        .ledger
        .check_intake("10.0.0.2", t0() + TimeDelta::minutes(10))
        .await
        .expect("check should succeed");
    assert_eq!(other, IntakeDecision::Allowed);

    let later = db
        .ledger
        .check_intake(ip, t0() + TimeDelta::minutes(90))
        .await
        .expect("check should succeed");
    assert_eq!(later, IntakeDecision::Allowed);

    db.ledger
        .record_submission(ip, t0() + TimeDelta::minutes(90))
        .await
        .expect("record should succeed");
    let retained: i64 =
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}.report_submissions WHERE ip_address = $1",
            db.schema
        ))
        .bind(ip)
        .fetch_one(&db.admin)
        .await
        .expect("count should succeed");
    assert_eq!(retained, 1, "rows past the window should be pruned");

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn five_stopped_reports_stop_a_line_without_status() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping aggregation test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;

    let line_id: i64 = sqlx::query_scalar(&format!(
        "INSERT INTO {}.metro_lines (name, code, color) VALUES ('Linha 15 - Prata', 'line15', '#8c8c8c') RETURNING id",
        db.schema
    ))
    .fetch_one(&db.admin)
    .await
    .expect("insert line should succeed");

    assert!(
        db.ledger
            .current_status(line_id)
            .await
            .expect("status should load")
            .is_none()
    );

    for i in 0..5 {
        let now = t0() + TimeDelta::minutes(i * 5);
        db.ledger
            .insert_report(&report(line_id, IssueType::Stopped), now)
            .await
            .expect("insert report should succeed");
        let transition = db
            .ledger
            .reevaluate_status(line_id, LineStatus::Stopped, now)
            .await
            .expect("reevaluate should succeed");
        if i < 4 {
            assert!(transition.is_none(), "no transition before the 5th report");
        } else {
            let record = transition.expect("5th report should stop the line");
            assert_eq!(record.status, LineStatus::Stopped);
            assert_eq!(record.message, None);
        }
    }

    let current = db
        .ledger
        .current_status(line_id)
        .await
        .expect("status should load")
        .expect("line should have a current status");
    assert_eq!(current.status, LineStatus::Stopped);
    assert_eq!(current_count(&db, line_id).await, 1);

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delayed_reports_promote_only_from_normal() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping aggregation test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let line_id = create_line(&db.ledger, "line2").await;

    db.ledger
        .insert_report(&report(line_id, IssueType::Crowded), t0())
        .await
        .expect("insert report should succeed");
    db.ledger
        .insert_report(&report(line_id, IssueType::Technical), t0())
        .await
        .expect("insert report should succeed");

    let now = t0() + TimeDelta::minutes(3);
    db.ledger
        .insert_report(&report(line_id, IssueType::Delay), now)
        .await
        .expect("insert report should succeed");
    let record = db
        .ledger
        .reevaluate_status(line_id, LineStatus::Delayed, now)
        .await
        .expect("reevaluate should succeed")
        .expect("3 recent reports from normal should delay the line");
    assert_eq!(record.status, LineStatus::Delayed);

    let now = t0() + TimeDelta::minutes(4);
    db.ledger
        .insert_report(&report(line_id, IssueType::Delay), now)
        .await
        .expect("insert report should succeed");
    let unchanged = db
        .ledger
        .reevaluate_status(line_id, LineStatus::Delayed, now)
        .await
        .expect("reevaluate should succeed");
    assert!(unchanged.is_none(), "already delayed lines stay as they are");

    let history = db
        .ledger
        .status_history(line_id, 10)
        .await
        .expect("history should load");
    assert_eq!(history.len(), 2);
    assert!(history[0].is_current);
    assert!(!history[1].is_current);
    assert_eq!(history[1].ended_at, Some(t0() + TimeDelta::minutes(3)));

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_outside_the_hour_do_not_count() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping aggregation test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let line_id = create_line(&db.ledger, "line3").await;

    for _ in 0..4 {
        db.ledger
            .insert_report(&report(line_id, IssueType::Stopped), t0())
            .await
            .expect("insert report should succeed");
    }

    let now = t0() + TimeDelta::minutes(61);
    db.ledger
        .insert_report(&report(line_id, IssueType::Stopped), now)
        .await
        .expect("insert report should succeed");
    let transition = db
        .ledger
        .reevaluate_status(line_id, LineStatus::Stopped, now)
        .await
        .expect("reevaluate should succeed");
    assert!(transition.is_none());

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_overrides_keep_exactly_one_current_record() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping override test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let line_id = create_line(&db.ledger, "line4").await;

    let record = db
        .ledger
        .force_status(line_id, LineStatus::Stopped, Some("falha na via"), t0())
        .await
        .expect("override should succeed");
    assert_eq!(record.message.as_deref(), Some("falha na via"));
    assert_eq!(current_count(&db, line_id).await, 1);

    let mut handles = Vec::new();
    for i in 0..8 {
        let ledger = db.ledger.clone();
        let status = LineStatus::ALL[i % LineStatus::ALL.len()];
        handles.push(tokio::spawn(async move {
            let now = t0() + TimeDelta::seconds(i as i64 + 1);
            ledger.force_status(line_id, status, None, now).await
        }));
    }
    for handle in handles {
        handle
            .await
            .expect("task should join")
            .expect("override should succeed");
    }

    assert_eq!(current_count(&db, line_id).await, 1);
    let history = db
        .ledger
        .status_history(line_id, 100)
        .await
        .expect("history should load");
    assert_eq!(history.len(), 10);
    assert!(
        history
            .iter()
            .filter(|record| !record.is_current)
            .all(|record| record.ended_at.is_some())
    );

    let missing = db
        .ledger
        .force_status(i64::MAX, LineStatus::Normal, None, t0())
        .await
        .expect_err("unknown lines must be rejected");
    assert!(matches!(missing, LedgerError::NotFound("line")));

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overrides_racing_automatic_transitions_keep_one_current_record() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping transition race test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let line_id = create_line(&db.ledger, "line5").await;

    for minutes in 0..5 {
        db.ledger
            .insert_report(&report(line_id, IssueType::Stopped), t0() + TimeDelta::minutes(minutes))
            .await
            .expect("insert report should succeed");
    }
    for minutes in 5..8 {
        db.ledger
            .insert_report(&report(line_id, IssueType::Delay), t0() + TimeDelta::minutes(minutes))
            .await
            .expect("insert report should succeed");
    }

    let now = t0() + TimeDelta::minutes(10);
    let mut handles = Vec::new();
    for i in 0..12usize {
        let ledger = db.ledger.clone();
        handles.push(tokio::spawn(async move {
            match i % 3 {
                0 => ledger
                    .force_status(line_id, LineStatus::Normal, None, now)
                    .await
                    .map(|_| ()),
                1 => ledger
                    .reevaluate_status(line_id, LineStatus::Stopped, now)
                    .await
                    .map(|_| ()),
                _ => ledger
                    .reevaluate_status(line_id, LineStatus::Delayed, now)
                    .await
                    .map(|_| ()),
            }
        }));
    }
    for handle in handles {
        handle
            .await
            .expect("task should join")
            .expect("transition should succeed");
    }

    assert_eq!(current_count(&db, line_id).await, 1);
    let history = db
        .ledger
        .status_history(line_id, 100)
        .await
        .expect("history should load");
    // Initial record, four overrides and at least the four stopped re-opens.
    assert!(history.len() >= 9);
    assert!(
        history
            .iter()
            .filter(|record| !record.is_current)
            .all(|record| record.ended_at.is_some())
    );

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn summaries_and_trend_use_their_own_windows() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping statistics window test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let line_id = create_line(&db.ledger, "line6").await;

    db.ledger
        .insert_report(&report(line_id, IssueType::Delay), t0() - TimeDelta::days(20))
        .await
        .expect("insert report should succeed");
    db.ledger
        .insert_report(&report(line_id, IssueType::Crowded), t0() - TimeDelta::days(1))
        .await
        .expect("insert report should succeed");

    let stats = db
        .ledger
        .statistics(StatsWindow::default(), StatsWindow::Week, t0())
        .await
        .expect("statistics should load");
    assert_eq!(stats.window, StatsWindow::Month);
    assert_eq!(stats.trend_window, StatsWindow::Week);
    assert_eq!(stats.issues_by_line.len(), 1);
    assert_eq!(stats.issues_by_line[0].value, 2);
    assert_eq!(stats.issues_by_type.iter().map(|c| c.value).sum::<i64>(), 2);
    assert_eq!(stats.daily_trend.len(), 1);
    assert_eq!(stats.daily_trend[0].issues, 1);
    assert!(stats.daily_trend[0].day >= t0() - TimeDelta::days(7));

    db.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_are_listed_grouped_and_deleted() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping statistics test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };
    let db = TestDb::start(&db_url).await;
    let blue = create_line(&db.ledger, "line1").await;
    let green = create_line(&db.ledger, "line2").await;

    let station = db
        .ledger
        .create_station(&NewStation {
            line_id: blue,
            name: "Luz".to_string(),
            position: 9,
        })
        .await
        .expect("create station should succeed");

    let duplicate = db
        .ledger
        .create_station(&NewStation {
            line_id: blue,
            name: "Sé".to_string(),
            position: 9,
        })
        .await
        .expect_err("positions are unique per line");
    assert!(matches!(duplicate, LedgerError::Conflict(_)));

    let mut on_station = report(blue, IssueType::Delay);
    on_station.station_id = Some(station.id);
    on_station.description = Some("trens parados".to_string());
    db.ledger
        .insert_report(&on_station, t0())
        .await
        .expect("insert report should succeed");

    let mut wrong_station = report(green, IssueType::Delay);
    wrong_station.station_id = Some(station.id);
    let err = db
        .ledger
        .insert_report(&wrong_station, t0())
        .await
        .expect_err("station must belong to the report's line");
    assert!(matches!(err, LedgerError::NotFound(_)));

    db.ledger
        .insert_report(&report(blue, IssueType::Crowded), t0() + TimeDelta::hours(1))
        .await
        .expect("insert report should succeed");
    let green_report = db
        .ledger
        .insert_report(&report(green, IssueType::Delay), t0() + TimeDelta::hours(2))
        .await
        .expect("insert report should succeed");
    db.ledger
        .insert_report(&report(green, IssueType::Other), t0() - TimeDelta::days(10))
        .await
        .expect("insert report should succeed");

    let now = t0() + TimeDelta::hours(3);
    let stats = db
        .ledger
        .statistics(StatsWindow::Week, StatsWindow::Week, now)
        .await
        .expect("statistics should load");
    assert_eq!(stats.window, StatsWindow::Week);
    assert_eq!(stats.issues_by_line[0].line_id, blue);
    assert_eq!(stats.issues_by_line[0].value, 2);
    assert_eq!(stats.issues_by_line[1].value, 1);
    assert_eq!(stats.issues_by_type[0].name, "delay");
    assert_eq!(stats.issues_by_type[0].value, 2);
    assert_eq!(stats.daily_trend.len(), 1);
    assert_eq!(stats.daily_trend[0].issues, 3);
    assert_eq!(stats.daily_trend[0].label, "Mon");

    let month = db
        .ledger
        .statistics(StatsWindow::Month, StatsWindow::Week, now)
        .await
        .expect("statistics should load");
    let total: i64 = month.issues_by_type.iter().map(|c| c.value).sum();
    assert_eq!(total, 4);

    let detail = db
        .ledger
        .line_detail("line1", now)
        .await
        .expect("detail should load")
        .expect("line1 should exist");
    assert_eq!(detail.stations.len(), 1);
    assert_eq!(detail.reports.len(), 2);
    assert_eq!(detail.reports[1].station_name.as_deref(), Some("Luz"));
    assert_eq!(detail.issue_history.len(), 2);
    assert_eq!(
        detail.current_status.map(|s| s.status),
        Some(LineStatus::Normal)
    );

    let recent = db
        .ledger
        .recent_reports(2)
        .await
        .expect("recent reports should load");
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].report.id, green_report.id);
    assert_eq!(recent[0].line_code, "line2");

    let deleted = db
        .ledger
        .delete_report(green_report.id)
        .await
        .expect("delete should succeed");
    assert_eq!(deleted.line_code, "line2");
    let again = db
        .ledger
        .delete_report(green_report.id)
        .await
        .expect_err("second delete must fail");
    assert!(matches!(again, LedgerError::NotFound("report")));

    let delayed_lines = db
        .ledger
        .list_lines(Some(LineStatus::Delayed))
        .await
        .expect("line list should load");
    assert!(delayed_lines.is_empty());
    let all_lines = db.ledger.list_lines(None).await.expect("line list should load");
    assert_eq!(all_lines.len(), 2);
    assert_eq!(all_lines[0].status, Some(LineStatus::Normal));

    db.finish().await;
}
