mod common;

use common::{Script, client_packets, config, connect, connect_with, err, ok, prepare_ok};
use sqlwire_core::error::{ConnectionErrorKind, ProtocolErrorKind, UsageErrorKind};
use sqlwire_core::{Date, DateTime, Time, Value};
use sqlwire_mysql::types::column_flags::{NOT_NULL, UNSIGNED};
use sqlwire_mysql::{ConnectionState, FieldType, QueryResult};

const PEOPLE_SQL: &str = "SELECT id, born, seen FROM people WHERE born = ? AND seen > ?";

fn people_columns() -> [(&'static str, FieldType, u16, u16); 3] {
    [
        ("id", FieldType::LongLong, NOT_NULL, 63),
        ("born", FieldType::Date, 0, 63),
        ("seen", FieldType::DateTime, 0, 63),
    ]
}

fn params() -> [(&'static str, FieldType, u16, u16); 2] {
    [("?", FieldType::VarString, 0, 63), ("?", FieldType::VarString, 0, 63)]
}

/// Greeting, login, then the prepare response for [`PEOPLE_SQL`].
fn prepared_script(deprecate_eof: bool) -> Script {
    let mut script = Script::new(deprecate_eof);
    script
        .reply()
        .packet(&prepare_ok(1, 3, 2))
        .column_defs(&params())
        .column_defs(&people_columns());
    script
}

#[test]
fn test_prepare_reads_param_and_column_definitions() {
    for deprecate_eof in [true, false] {
        let (mut conn, written) = connect(prepared_script(deprecate_eof));
        let stmt = conn.prepare(PEOPLE_SQL).unwrap();

        assert_eq!(stmt.id(), 1);
        assert_eq!(stmt.param_count(), 2);
        assert_eq!(stmt.columns().len(), 3);
        assert_eq!(stmt.columns()[1].name, "born");
        assert_eq!(conn.state(), ConnectionState::Idle);

        let packets = client_packets(&written);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1[0], 0x16);
        assert_eq!(&packets[0].1[1..], PEOPLE_SQL.as_bytes());
    }
}

#[test]
fn test_execute_binds_temporal_params_and_reads_binary_rows() {
    let mut script = prepared_script(true);

    let mut row = vec![0x00, 0b0000_0000];
    row.extend_from_slice(&7i64.to_le_bytes());
    row.extend_from_slice(&[4, 0xC8, 0x07, 5, 17]);
    row.extend_from_slice(&[11, 0xE8, 0x07, 2, 29, 13, 45, 1, 0x40, 0xE2, 0x01, 0x00]);

    // second row: born is NULL (bit 3)
    let mut null_row = vec![0x00, 0b0000_1000];
    null_row.extend_from_slice(&8i64.to_le_bytes());
    null_row.extend_from_slice(&[0]);

    script
        .reply()
        .columns(&people_columns())
        .packet(&row)
        .packet(&null_row)
        .done();
    let (mut conn, written) = connect(script);

    let stmt = conn.prepare(PEOPLE_SQL).unwrap();
    written.lock().unwrap().clear();

    let born = Date::new(1992, 5, 17).unwrap();
    let seen = DateTime::new(2024, 1, 1, 8, 30, 0, 0).unwrap();
    let result = conn
        .execute(&stmt, &[Value::Date(born), Value::DateTime(seen)])
        .unwrap();
    let QueryResult::Rows(mut rows) = result else {
        panic!("expected rows");
    };

    let first = rows.next_row().unwrap().unwrap();
    let (id, born_out, seen_out): (i64, Date, DateTime) = first.scan().unwrap();
    assert_eq!(id, 7);
    assert_eq!(born_out, born);
    assert_eq!(
        seen_out,
        DateTime::new(2024, 2, 29, 13, 45, 1, 123_456).unwrap()
    );

    let second = rows.next_row().unwrap().unwrap();
    assert_eq!(second.get(1), Some(&Value::Null));
    let (_, born_null, zero): (i64, Option<Date>, DateTime) = second.scan().unwrap();
    assert_eq!(born_null, None);
    assert_eq!(zero, DateTime::default());

    assert!(rows.next_row().unwrap().is_none());
    drop(rows);
    assert_eq!(conn.state(), ConnectionState::Idle);

    let packets = client_packets(&written);
    assert_eq!(packets.len(), 1);
    let mut expected = vec![0x17, 1, 0, 0, 0, 0x00, 1, 0, 0, 0];
    // null bitmap, new-params-bound, types
    expected.extend_from_slice(&[0x00, 0x01, 0x0A, 0x00, 0x0C, 0x00]);
    // shortest encodings: date is 4 bytes, datetime without micros is 7
    expected.extend_from_slice(&[4, 0xC8, 0x07, 5, 17]);
    expected.extend_from_slice(&[7, 0xE8, 0x07, 1, 1, 8, 30, 0]);
    assert_eq!(packets[0], (0, expected));
}

#[test]
fn test_execute_null_and_time_params() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(3, 0, 3))
        .column_defs(&[
            ("?", FieldType::VarString, 0, 63),
            ("?", FieldType::VarString, 0, 63),
            ("?", FieldType::VarString, 0, 63),
        ])
        .reply()
        .packet(&ok(1, 0, 0x0002));
    let (mut conn, written) = connect(script);

    let stmt = conn.prepare("INSERT INTO shifts VALUES (?, ?, ?)").unwrap();
    written.lock().unwrap().clear();

    let length = Time::new(true, 1, 2, 3, 4, 0).unwrap();
    let done = conn
        .execute(&stmt, &[Value::Null, Value::Time(length), Value::BigInt(-1)])
        .unwrap()
        .finish()
        .unwrap();
    assert_eq!(done.affected_rows, 1);

    let packets = client_packets(&written);
    let payload = &packets[0].1;
    assert_eq!(payload[0], 0x17);
    assert_eq!(payload[10], 0b0000_0001);
    assert_eq!(payload[11], 0x01);
    assert_eq!(&payload[12..18], &[0x06, 0x00, 0x0B, 0x00, 0x08, 0x00]);
    assert_eq!(&payload[18..27], &[8, 1, 1, 0, 0, 0, 2, 3, 4]);
    assert_eq!(&payload[27..], &(-1i64).to_le_bytes());
}

#[test]
fn test_parameter_count_mismatch_sends_nothing() {
    let (mut conn, written) = connect(prepared_script(true));
    let stmt = conn.prepare(PEOPLE_SQL).unwrap();
    written.lock().unwrap().clear();

    let err = conn.execute(&stmt, &[Value::Int(1)]).unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::ParameterCountMismatch));
    assert!(written.lock().unwrap().is_empty());
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_closed_statement_is_rejected_without_io() {
    let (mut conn, written) = connect(prepared_script(true));
    let mut stmt = conn.prepare(PEOPLE_SQL).unwrap();
    written.lock().unwrap().clear();

    conn.close_statement(&mut stmt).unwrap();
    assert!(stmt.is_closed());
    let packets = client_packets(&written);
    assert_eq!(packets, vec![(0, vec![0x19, 1, 0, 0, 0])]);

    // closing twice is a no-op
    conn.close_statement(&mut stmt).unwrap();
    written.lock().unwrap().clear();

    let params = [Value::Null, Value::Null];
    let err = conn.execute(&stmt, &params).unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::StatementClosed));
    let err = conn.reset_statement(&stmt).unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::StatementClosed));
    assert!(written.lock().unwrap().is_empty());
}

#[test]
fn test_with_statement_closes_on_success_and_error() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(5, 0, 1))
        .column_defs(&[("?", FieldType::VarString, 0, 63)])
        .reply()
        .packet(&ok(1, 99, 0x0002))
        .reply()
        .packet(&prepare_ok(6, 0, 1))
        .column_defs(&[("?", FieldType::VarString, 0, 63)]);
    let (mut conn, written) = connect(script);

    let id = conn
        .with_statement("INSERT INTO users (name) VALUES (?)", |conn, stmt| {
            conn.execute(stmt, &[Value::Text("bob".into())])?.finish()?;
            Ok(conn.last_insert_id())
        })
        .unwrap();
    assert_eq!(id, 99);

    let err = conn
        .with_statement("INSERT INTO users (name) VALUES (?)", |conn, stmt| {
            conn.execute(stmt, &[])?.finish()
        })
        .unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::ParameterCountMismatch));

    let closes: Vec<_> = client_packets(&written)
        .into_iter()
        .filter(|(_, payload)| payload[0] == 0x19)
        .map(|(_, payload)| payload)
        .collect();
    assert_eq!(closes, vec![vec![0x19, 5, 0, 0, 0], vec![0x19, 6, 0, 0, 0]]);
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_reset_statement() {
    let mut script = prepared_script(true);
    script.reply().packet(&ok(0, 0, 0x0002));
    let (mut conn, written) = connect(script);

    let stmt = conn.prepare(PEOPLE_SQL).unwrap();
    written.lock().unwrap().clear();
    conn.reset_statement(&stmt).unwrap();

    assert_eq!(client_packets(&written), vec![(0, vec![0x1A, 1, 0, 0, 0])]);
}

#[test]
fn test_prepare_error_is_a_query_error() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&err(1064, "42000", "You have an error in your SQL syntax"));
    let (mut conn, _) = connect(script);

    let e = conn.prepare("SELEC 1").unwrap_err();
    assert_eq!(e.server_code(), Some(1064));
    assert_eq!(e.sql(), Some("SELEC 1"));
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_statement_from_another_connection_is_rejected() {
    let (mut first, _) = connect(prepared_script(true));
    let stmt = first.prepare(PEOPLE_SQL).unwrap();

    let (mut second, written) = connect(Script::new(true));
    let err = second
        .execute(&stmt, &[Value::Null, Value::Null])
        .unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::StatementClosed));
    assert!(written.lock().unwrap().is_empty());
}

#[test]
fn test_binary_row_with_unsigned_column() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(2, 1, 0))
        .column_defs(&[("n", FieldType::Long, UNSIGNED, 63)])
        .reply()
        .columns(&[("n", FieldType::Long, UNSIGNED, 63)])
        .packet(&[0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF])
        .done();
    let (mut conn, _) = connect(script);

    let stmt = conn.prepare("SELECT n FROM t").unwrap();
    let rows = conn
        .execute(&stmt, &[])
        .unwrap()
        .into_rows()
        .unwrap()
        .collect_all()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_as::<u32>(0).unwrap(), u32::MAX);
}

#[test]
fn test_close_waits_for_open_result_set_when_drain_disabled() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(9, 0, 0))
        .reply()
        .columns(&[("n", FieldType::Long, 0, 63)])
        .text_row(&[Some("1")])
        .text_row(&[Some("2")])
        .done();
    let (mut conn, written) = connect_with(script, config().drain_on_new_command(false));

    let mut stmt = conn.prepare("DO 1").unwrap();
    {
        let mut rows = conn.query("SELECT n FROM t").unwrap().into_rows().unwrap();
        rows.next_row().unwrap();
    }
    written.lock().unwrap().clear();

    let e = conn.close_statement(&mut stmt).unwrap_err();
    assert_eq!(e.usage_kind(), Some(UsageErrorKind::ResultSetNotDrained));
    assert!(!stmt.is_closed());
    assert!(written.lock().unwrap().is_empty());

    conn.drain_pending().unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
    conn.close_statement(&mut stmt).unwrap();
    assert!(stmt.is_closed());
    assert_eq!(client_packets(&written), vec![(0, vec![0x19, 9, 0, 0, 0])]);
}

#[test]
fn test_with_statement_closes_after_unread_rows() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(4, 1, 0))
        .column_defs(&[("n", FieldType::LongLong, 0, 63)])
        .reply()
        .columns(&[("n", FieldType::LongLong, 0, 63)])
        .packet(&[0x00, 0x00, 1, 0, 0, 0, 0, 0, 0, 0])
        .packet(&[0x00, 0x00, 2, 0, 0, 0, 0, 0, 0, 0])
        .done();
    let (mut conn, written) = connect_with(script, config().drain_on_new_command(false));

    let first = conn
        .with_statement("SELECT n FROM t", |conn, stmt| {
            let mut rows = conn.execute(stmt, &[])?.into_rows().unwrap();
            let row = rows.next_row()?.unwrap();
            row.get_as::<i64>(0)
        })
        .unwrap();
    assert_eq!(first, 1);
    assert_eq!(conn.state(), ConnectionState::Idle);

    let last = client_packets(&written).pop().unwrap();
    assert_eq!(last, (0, vec![0x19, 4, 0, 0, 0]));
}

#[test]
fn test_invalid_temporal_cell_breaks_connection() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(8, 1, 0))
        .column_defs(&[("born", FieldType::Date, 0, 63)])
        .reply()
        .columns(&[("born", FieldType::Date, 0, 63)])
        // month 13
        .packet(&[0x00, 0x00, 4, 0xE8, 0x07, 13, 1])
        .done();
    let (mut conn, written) = connect(script);

    let stmt = conn.prepare("SELECT born FROM people").unwrap();
    {
        let mut rows = conn.execute(&stmt, &[]).unwrap().into_rows().unwrap();
        let e = rows.next_row().unwrap_err();
        assert_eq!(e.protocol_kind(), Some(ProtocolErrorKind::InvalidTemporalEncoding));
        assert!(e.is_fatal());
        assert!(rows.is_finished());
    }
    assert_eq!(conn.state(), ConnectionState::Broken);

    written.lock().unwrap().clear();
    let e = conn.ping().unwrap_err();
    assert_eq!(e.connection_kind(), Some(ConnectionErrorKind::Disconnected));
    assert!(written.lock().unwrap().is_empty());
}

#[test]
fn test_repeated_inserts_report_distinct_ids() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(4, 0, 2))
        .column_defs(&params())
        .reply()
        .packet(&ok(1, 1, 0x0002))
        .reply()
        .packet(&ok(1, 2, 0x0002));
    let (mut conn, written) = connect(script);

    let stmt = conn.prepare("INSERT INTO t VALUES (?, ?)").unwrap();
    written.lock().unwrap().clear();

    let mut ids = Vec::new();
    for (name, age) in [("John", 42), ("Sam", 24)] {
        let done = conn
            .execute(&stmt, &[Value::from(name), Value::Int(age)])
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(done.affected_rows, 1);
        ids.push(done.last_insert_id);
    }
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(conn.last_insert_id(), 2);

    let packets = client_packets(&written);
    assert_eq!(packets.len(), 2);
    for (seq, payload) in &packets {
        assert_eq!(*seq, 0);
        assert_eq!(&payload[..5], &[0x17, 4, 0, 0, 0]);
    }
    assert!(packets[0].1.ends_with(&42i32.to_le_bytes()));
    assert!(packets[1].1.ends_with(&24i32.to_le_bytes()));
}

#[test]
fn test_binary_time_column_with_days_and_micros() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&prepare_ok(7, 1, 0))
        .column_defs(&[("shift", FieldType::Time, 0, 63)])
        .reply()
        .columns(&[("shift", FieldType::Time, 0, 63)])
        .packet(&[0x00, 0x00, 12, 0, 1, 0, 0, 0, 23, 59, 59, 0x40, 0xE2, 0x01, 0x00])
        .done();
    let (mut conn, _) = connect(script);

    let stmt = conn.prepare("SELECT shift FROM rota").unwrap();
    let rows = conn
        .execute(&stmt, &[])
        .unwrap()
        .into_rows()
        .unwrap()
        .collect_all()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get(0),
        Some(&Value::Time(Time::new(false, 1, 23, 59, 59, 123_456).unwrap()))
    );
}
