//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use rusqlite::Connection;

use filament::machine::Machine;

/// An output sink tests can read back after the machine wrote to it.
#[derive(Clone, Default)]
pub struct SharedOut(Rc<RefCell<Vec<u8>>>);

impl SharedOut {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Attach a capturing sink to the machine and return it.
pub fn capture(machine: &mut Machine) -> SharedOut {
    let out = SharedOut::default();
    machine.set_output(Box::new(out.clone()));
    out
}

/// Write a bundle file: bindings as (name, lazy, json body), entry-point
/// names, and dependency edges as (binding, needs).
pub fn write_bundle(
    path: &Path,
    bindings: &[(&str, bool, &str)],
    entries: &[&str],
    deps: &[(&str, &str)],
) {
    let conn = Connection::open(path).expect("create bundle");
    conn.execute_batch(
        "CREATE TABLE bindings (id_name TEXT PRIMARY KEY, lazy INTEGER, value TEXT, file_name TEXT);
         CREATE TABLE entry_points (id_name TEXT);
         CREATE TABLE depends_ons (id_name TEXT, needs TEXT);",
    )
    .expect("create schema");

    for &(name, lazy, body) in bindings {
        conn.execute(
            "INSERT INTO bindings (id_name, lazy, value, file_name) VALUES (?1, ?2, ?3, ?4)",
            (name, lazy as i64, body, "test.fil"),
        )
        .expect("insert binding");
    }
    for &name in entries {
        conn.execute("INSERT INTO entry_points (id_name) VALUES (?1)", [name])
            .expect("insert entry point");
    }
    for &(name, needs) in deps {
        conn.execute("INSERT INTO depends_ons (id_name, needs) VALUES (?1, ?2)", (name, needs))
            .expect("insert dependency");
    }
}
