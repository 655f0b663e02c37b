mod common;

use common::{Script, client_packets, connect, connect_with, config, err, ok};
use sqlwire_core::error::{ConnectionErrorKind, ProtocolErrorKind, QueryErrorKind, UsageErrorKind};
use sqlwire_core::{DateTime, Value};
use sqlwire_mysql::types::column_flags::{NOT_NULL, PRIMARY_KEY, UNSIGNED};
use sqlwire_mysql::{ConnectionState, FieldType, QueryResult, RowSchema, SemanticType};

#[test]
fn test_insert_reports_affected_rows_and_insert_id() {
    let mut script = Script::new(true);
    script.reply().packet(&ok(1, 42, 0x0002));
    let (mut conn, written) = connect(script);

    let done = conn.query_drop("INSERT INTO users (name) VALUES ('alice')").unwrap();
    assert_eq!(done.affected_rows, 1);
    assert_eq!(done.last_insert_id, 42);
    assert_eq!(conn.affected_rows(), 1);
    assert_eq!(conn.last_insert_id(), 42);
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert!(conn.autocommit());
    assert!(!conn.in_transaction());

    let packets = client_packets(&written);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].0, 0);
    assert_eq!(packets[0].1[0], 0x03);
    assert_eq!(&packets[0].1[1..], b"INSERT INTO users (name) VALUES ('alice')");
}

fn select_script(deprecate_eof: bool) -> Script {
    let mut script = Script::new(deprecate_eof);
    script
        .reply()
        .columns(&[
            ("id", FieldType::LongLong, NOT_NULL | PRIMARY_KEY | UNSIGNED, 63),
            ("name", FieldType::VarString, 0, 255),
            ("created", FieldType::DateTime, 0, 63),
        ])
        .text_row(&[Some("1"), Some("alice"), Some("2024-02-29 13:45:00")])
        .text_row(&[Some("2"), None, Some("2023-12-31 23:59:59.250000")])
        .done();
    script
}

#[test]
fn test_select_rows_with_either_terminator() {
    for deprecate_eof in [true, false] {
        let (mut conn, _) = connect(select_script(deprecate_eof));
        let rows = conn.query_rows("SELECT id, name, created FROM users").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str(1), Some("alice"));
        assert!(rows[1].is_null(1));

        let first = rows[0].decode();
        assert_eq!(first.get(0), Some(&Value::UnsignedBigInt(1)));
        assert_eq!(
            first.get_as::<DateTime>(2).unwrap(),
            DateTime::new(2024, 2, 29, 13, 45, 0, 0).unwrap()
        );
        let second: (u64, Option<String>, DateTime) = rows[1].scan().unwrap();
        assert_eq!(second.0, 2);
        assert_eq!(second.1, None);
        assert_eq!(second.2.microsecond, 250_000);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }
}

#[test]
fn test_lazy_rows_and_completion() {
    let (mut conn, _) = connect(select_script(true));
    let QueryResult::Rows(mut rows) = conn.query("SELECT id, name, created FROM users").unwrap()
    else {
        panic!("expected rows");
    };
    assert_eq!(rows.columns().len(), 3);
    assert_eq!(rows.columns()[1].name, "name");

    {
        let row = rows.next_raw().unwrap().unwrap();
        assert_eq!(row.raw(1), Some(&b"alice"[..]));
        let mut dest = vec![None; 3];
        row.scan_into(&mut dest).unwrap();
        assert_eq!(dest[0].as_deref(), Some(&b"1"[..]));
    }
    assert!(rows.completion().is_none());

    let rest: Vec<_> = rows.by_ref().collect::<Result<_, _>>().unwrap();
    assert_eq!(rest.len(), 1);
    assert!(rows.is_finished());
    assert_eq!(rows.completion().unwrap().status_flags, 0x0002);
    drop(rows);
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_scan_next_with_schema() {
    let (mut conn, _) = connect(select_script(false));
    let mut rows = conn
        .query("SELECT id, name, created FROM users")
        .unwrap()
        .into_rows()
        .unwrap();

    let schema = RowSchema::new()
        .column(SemanticType::UnsignedInteger)
        .nullable(SemanticType::Text)
        .column(SemanticType::DateTime);
    rows.check_schema(&schema).unwrap();

    let wrong = RowSchema::new()
        .column(SemanticType::UnsignedInteger)
        .column(SemanticType::Date)
        .column(SemanticType::DateTime);
    assert!(rows.check_schema(&wrong).is_err());

    let (id, name, _): (u64, Option<String>, DateTime) = rows.scan_next().unwrap().unwrap();
    assert_eq!((id, name.as_deref()), (1, Some("alice")));
    let err = rows.scan_next::<(u64, String, DateTime)>().unwrap_err();
    assert_eq!(err.type_kind(), Some(sqlwire_core::TypeErrorKind::UnexpectedNull));
}

#[test]
fn test_transaction_status_tracks_ok_packets() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&ok(0, 0, 0x0001))
        .reply()
        .packet(&ok(0, 0, 0x0002));
    let (mut conn, _) = connect(script);

    conn.query_drop("BEGIN").unwrap();
    assert!(conn.in_transaction());
    assert!(!conn.autocommit());
    conn.query_drop("COMMIT").unwrap();
    assert!(!conn.in_transaction());
}

#[test]
fn test_server_error_keeps_connection_usable() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(&err(1146, "42S02", "Table 'app.nope' doesn't exist"))
        .reply()
        .packet(&ok(0, 0, 0x0002));
    let (mut conn, _) = connect(script);

    let e = conn.query_drop("SELECT * FROM nope").unwrap_err();
    assert_eq!(e.server_code(), Some(1146));
    assert_eq!(e.sqlstate(), Some("42S02"));
    assert_eq!(e.sql(), Some("SELECT * FROM nope"));
    assert!(matches!(e, sqlwire_core::Error::Query(ref q) if q.kind == QueryErrorKind::NotFound));
    assert_eq!(conn.state(), ConnectionState::Idle);

    conn.query_drop("DO 1").unwrap();
}

#[test]
fn test_error_in_place_of_row_ends_the_set() {
    let mut script = Script::new(true);
    script
        .reply()
        .columns(&[("n", FieldType::Long, 0, 63)])
        .text_row(&[Some("1")])
        .packet(&err(1317, "70100", "Query execution was interrupted"))
        .reply()
        .packet(&ok(0, 0, 0x0002));
    let (mut conn, _) = connect(script);

    let mut rows = conn.query("SELECT SLEEP(10)").unwrap().into_rows().unwrap();
    assert!(rows.next_row().unwrap().is_some());
    let e = rows.next_row().unwrap_err();
    assert_eq!(e.server_code(), Some(1317));
    assert!(rows.next_row().unwrap().is_none());
    drop(rows);

    assert_eq!(conn.state(), ConnectionState::Idle);
    conn.ping().unwrap();
}

#[test]
fn test_implicit_drain_before_next_command() {
    let mut script = Script::new(false);
    script
        .reply()
        .columns(&[("n", FieldType::Long, 0, 63)])
        .text_row(&[Some("1")])
        .text_row(&[Some("2")])
        .text_row(&[Some("3")])
        .done()
        .reply()
        .columns(&[("m", FieldType::Long, 0, 63)])
        .text_row(&[Some("99")])
        .done();
    let (mut conn, written) = connect(script);

    {
        let mut rows = conn.query("SELECT n FROM t").unwrap().into_rows().unwrap();
        let first = rows.next_row().unwrap().unwrap();
        assert_eq!(first.get_str(0), Some("1"));
    }
    assert_eq!(conn.state(), ConnectionState::ResultSetOpen);

    let rows = conn.query_rows("SELECT m FROM t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str(0), Some("99"));

    let packets = client_packets(&written);
    assert_eq!(packets.len(), 2);
    assert!(packets.iter().all(|(seq, _)| *seq == 0));
}

#[test]
fn test_undrained_result_set_rejected_when_drain_disabled() {
    let mut script = Script::new(true);
    script
        .reply()
        .columns(&[("n", FieldType::Long, 0, 63)])
        .text_row(&[Some("1")])
        .text_row(&[Some("2")])
        .done();
    let (mut conn, written) = connect_with(script, config().drain_on_new_command(false));

    {
        let mut rows = conn.query("SELECT n FROM t").unwrap().into_rows().unwrap();
        rows.next_row().unwrap();
    }
    let e = conn.query_drop("SELECT 1").unwrap_err();
    assert_eq!(e.usage_kind(), Some(UsageErrorKind::ResultSetNotDrained));
    assert_eq!(client_packets(&written).len(), 1);
    assert_eq!(conn.state(), ConnectionState::ResultSetOpen);
}

#[test]
fn test_desync_breaks_connection() {
    let mut script = Script::new(true);
    // server skips sequence 1
    script.reply();
    script.raw(&[7, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0]);
    let (mut conn, written) = connect(script);

    let e = conn.query_drop("DO 1").unwrap_err();
    assert_eq!(e.protocol_kind(), Some(ProtocolErrorKind::Desync));
    assert_eq!(conn.state(), ConnectionState::Broken);

    written.lock().unwrap().clear();
    let e = conn.ping().unwrap_err();
    assert_eq!(e.connection_kind(), Some(ConnectionErrorKind::Disconnected));
    assert!(written.lock().unwrap().is_empty());
}

#[test]
fn test_local_infile_is_refused() {
    let mut script = Script::new(true);
    script
        .reply()
        .packet(b"\xFB/etc/passwd")
        .seq(3)
        .packet(&err(1148, "42000", "The used command is not allowed"));
    let (mut conn, written) = connect(script);

    assert!(conn.query_drop("LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t").is_err());
    let packets = client_packets(&written);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[1], (2, Vec::new()));
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_select_mixed_literals() {
    let mut script = Script::new(true);
    script
        .reply()
        .columns(&[
            ("1", FieldType::LongLong, NOT_NULL, 63),
            ("2", FieldType::VarString, NOT_NULL, 255),
            ("3.14", FieldType::NewDecimal, NOT_NULL, 63),
            ("NULL", FieldType::Null, 0, 63),
        ])
        .text_row(&[Some("1"), Some("2"), Some("3.14"), None])
        .done();
    let (mut conn, _) = connect(script);

    let rows = conn.query_rows(r#"SELECT 1, "2", 3.14, NULL"#).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].values(),
        &[
            Some(b"1".to_vec()),
            Some(b"2".to_vec()),
            Some(b"3.14".to_vec()),
            None
        ]
    );

    let decoded = rows[0].decode();
    assert_eq!(decoded.get(0), Some(&Value::BigInt(1)));
    assert_eq!(decoded.get(1), Some(&Value::Text("2".to_string())));
    assert_eq!(decoded.get(2), Some(&Value::Decimal("3.14".to_string())));
    assert_eq!(decoded.get(3), Some(&Value::Null));
}

#[test]
fn test_small_max_packet_size_splits_and_reassembles() {
    const MAX: usize = 128;
    let long_name = "n".repeat(200);
    // 0x03 plus 255 bytes of SQL fills exactly two packets
    let sql = format!("SELECT '{}'", "x".repeat(246));
    assert_eq!(sql.len() + 1, 2 * MAX);

    let mut script = Script::new(true);
    script
        .split_at(MAX)
        // the command took sequence ids 0 to 2
        .seq(3)
        .columns(&[("name", FieldType::VarString, 0, 255)])
        .text_row(&[Some(long_name.as_str())])
        .done();
    let (mut conn, written) = connect_with(script, config().max_packet_size(MAX));

    let rows = conn.query_rows(&sql).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str(0), Some(long_name.as_str()));
    assert_eq!(conn.state(), ConnectionState::Idle);

    let packets = client_packets(&written);
    let shape: Vec<_> = packets.iter().map(|(seq, p)| (*seq, p.len())).collect();
    assert_eq!(shape, vec![(0, MAX), (1, MAX), (2, 0)]);
    let payload: Vec<u8> = packets.into_iter().flat_map(|(_, p)| p).collect();
    assert_eq!(payload[0], 0x03);
    assert_eq!(&payload[1..], sql.as_bytes());
}
