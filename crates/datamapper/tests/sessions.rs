mod common;

use std::any::TypeId;

use common::{block_on, config, context, invoice, numbers, seed_invoices};
use datamapper::prelude::*;
use datamapper_testkit::fixtures::Invoice;
use datamapper_testkit::{MemoryDatabase, unwrap_outcome};

#[test]
fn paging_returns_consecutive_windows() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    seed_invoices(
        &cx,
        &session,
        &[("E", 5.0), ("A", 1.0), ("D", 4.0), ("B", 2.0), ("C", 3.0)],
    );

    let page = |start, size| {
        let items = unwrap_outcome(block_on(
            session
                .query::<Invoice>()
                .order_by("Number")
                .page(start, size)
                .get_list(&cx, &session),
        ));
        numbers(&items)
    };
    assert_eq!(page(0, 2), vec!["A", "B"]);
    assert_eq!(page(2, 2), vec!["C", "D"]);
    assert_eq!(page(4, 2), vec!["E"]);
    assert!(page(6, 2).is_empty());
}

#[test]
fn paging_is_stable_across_equal_sort_keys() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    seed_invoices(
        &cx,
        &session,
        &[("A", 1.0), ("B", 1.0), ("C", 1.0), ("D", 1.0)],
    );

    let query = session.query::<Invoice>().filter(Criterion::gt("Total", 0.0));
    let mut seen = Vec::new();
    for start in [0, 2] {
        let items = unwrap_outcome(block_on(
            query
                .clone()
                .order_by("Total")
                .page(start, 2)
                .get_list(&cx, &session),
        ));
        seen.extend(numbers(&items));
    }
    seen.sort();
    assert_eq!(seen, vec!["A", "B", "C", "D"]);
}

#[test]
fn stale_writer_gets_concurrency_conflict() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let cx = Cx::for_testing();
    let first = ctx.session();
    let second = ctx.session();
    let saved = seed_invoices(&cx, &first, &[("INV-1", 10.0)]).remove(0);
    let id = saved.id.unwrap();

    let mut mine = unwrap_outcome(block_on(first.get_as::<Invoice>(&cx, id))).unwrap();
    let mut theirs = unwrap_outcome(block_on(second.get_as::<Invoice>(&cx, id))).unwrap();
    theirs.total = 20.0;
    unwrap_outcome(block_on(second.save(&cx, &mut theirs)));
    assert_eq!(theirs.version, 2);

    mine.total = 30.0;
    match block_on(first.save(&cx, &mut mine)) {
        Outcome::Err(e) => assert_eq!(e.entity_kind(), Some(EntityErrorKind::ConcurrencyConflict)),
        _ => panic!("stale save must conflict"),
    }
    let stored = &db.rows("invoices")[0];
    assert_eq!(stored.get_by_name("total"), Some(&Value::Double(20.0)));
    assert_eq!(stored.get_by_name("version"), Some(&Value::BigInt(2)));
}

#[test]
fn deleting_twice_reports_missing_record() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    let inv = seed_invoices(&cx, &session, &[("INV-1", 1.0)]).remove(0);

    unwrap_outcome(block_on(session.delete(&cx, &inv)));
    match block_on(session.delete(&cx, &inv)) {
        Outcome::Err(e) => assert!(e.is_missing_record()),
        _ => panic!("second delete must fail"),
    }
    assert_eq!(db.row_count("invoices"), 0);
    let gone = unwrap_outcome(block_on(session.get::<Invoice>(&cx, inv.id.unwrap())));
    assert!(gone.is_none());
}

#[test]
fn soft_deleted_rows_vanish_from_reads() {
    use datamapper_testkit::fixtures::Customer;

    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    let mut customer = Customer {
        name: "Acme".into(),
        ..Customer::default()
    };
    unwrap_outcome(block_on(session.save(&cx, &mut customer)));
    unwrap_outcome(block_on(session.delete(&cx, &customer)));

    assert_eq!(db.row_count("customers"), 1);
    let id = customer.id.unwrap();
    assert!(unwrap_outcome(block_on(session.get::<Customer>(&cx, id))).is_none());
    let count = unwrap_outcome(block_on(session.query::<Customer>().count(&cx, &session)));
    assert_eq!(count, 0);
    match block_on(session.delete(&cx, &customer)) {
        Outcome::Err(e) => assert!(e.is_missing_record()),
        _ => panic!("deleting a soft-deleted row must fail"),
    }
}

#[test]
fn validation_failure_touches_nothing() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    let mut blank = invoice("  ", 1.0);
    match block_on(session.save(&cx, &mut blank)) {
        Outcome::Err(Error::Validation(e)) => assert_eq!(e.errors[0].field, "Number"),
        _ => panic!("expected a validation error"),
    }
    assert_eq!(db.stats().statements, 0);
    assert_eq!(ctx.cache().query_timestamp(), None);
}

#[test]
fn transaction_reads_its_own_writes_and_publishes_on_commit() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let observer = ctx.session();
    let cx = Cx::for_testing();

    let id = block_on(async {
        let tx = session.enlist_or_create_transaction();
        let mut inv = invoice("INV-1", 5.0);
        unwrap_outcome(session.save(&cx, &mut inv).await);
        let id = inv.id.unwrap();

        let seen = unwrap_outcome(session.get_as::<Invoice>(&cx, id).await).unwrap();
        assert_eq!(seen.number, "INV-1");
        assert!(ctx.cache().get(TypeId::of::<Invoice>(), &Value::BigInt(id)).is_none());

        unwrap_outcome(tx.commit(&cx).await);
        id
    });

    assert!(!session.in_transaction());
    assert!(ctx.cache().get(TypeId::of::<Invoice>(), &Value::BigInt(id)).is_some());
    let before = db.stats().queries;
    let seen = unwrap_outcome(block_on(observer.get_as::<Invoice>(&cx, id))).unwrap();
    assert_eq!(seen.version, 1);
    assert_eq!(db.stats().queries, before);
    assert_eq!(db.stats().commits, 1);
}

#[test]
fn rolled_back_writes_never_reach_storage_or_cache() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();

    let id = block_on(async {
        let tx = session.enlist_or_create_transaction();
        let mut inv = invoice("INV-1", 5.0);
        unwrap_outcome(session.save(&cx, &mut inv).await);
        unwrap_outcome(tx.rollback(&cx).await);
        inv.id.unwrap()
    });

    assert_eq!(db.row_count("invoices"), 0);
    assert!(ctx.cache().get(TypeId::of::<Invoice>(), &Value::BigInt(id)).is_none());
    assert!(unwrap_outcome(block_on(session.get::<Invoice>(&cx, id))).is_none());
}

#[test]
fn counts_and_aggregates_follow_criteria() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    seed_invoices(&cx, &session, &[("A", 2.0), ("B", 4.0), ("C", 9.0)]);

    let cheap = session.query::<Invoice>().filter(Criterion::lt("Total", 5.0));
    assert_eq!(unwrap_outcome(block_on(cheap.count(&cx, &session))), 2);
    assert!(unwrap_outcome(block_on(cheap.any(&cx, &session))));
    assert_eq!(
        unwrap_outcome(block_on(cheap.sum(&cx, &session, "Total"))).as_f64(),
        Some(6.0)
    );
    assert_eq!(
        unwrap_outcome(block_on(cheap.avg(&cx, &session, "Total"))).as_f64(),
        Some(3.0)
    );
    assert_eq!(
        unwrap_outcome(block_on(cheap.max(&cx, &session, "Number"))),
        Value::Text("B".into())
    );

    let none = session.query::<Invoice>().where_eq("Number", "Z");
    assert!(!unwrap_outcome(block_on(none.any(&cx, &session))));
    assert_eq!(unwrap_outcome(block_on(none.sum(&cx, &session, "Total"))), Value::Null);

    let first = unwrap_outcome(block_on(
        session
            .query::<Invoice>()
            .order_by_desc("Total")
            .first_or_default(&cx, &session),
    ));
    assert_eq!(numbers(&first.into_iter().collect::<Vec<_>>()), vec!["C"]);
}

#[test]
fn unknown_property_is_rejected_before_io() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config());
    let session = ctx.session();
    let cx = Cx::for_testing();
    let outcome = block_on(
        session
            .query::<Invoice>()
            .where_eq("Colour", "red")
            .get_list(&cx, &session),
    );
    match outcome {
        Outcome::Err(e) => assert_eq!(e.entity_kind(), Some(EntityErrorKind::UnknownProperty)),
        _ => panic!("expected UnknownProperty"),
    }
    assert_eq!(db.stats().statements, 0);
}

#[test]
fn bulk_writes_then_invalidate_resynchronize_lists() {
    let db = MemoryDatabase::new();
    let ctx = context(&db, config().bulk_batch_size(2));
    let session = ctx.session();
    let cx = Cx::for_testing();
    seed_invoices(&cx, &session, &[("A", 1.0)]);
    let all = session.query::<Invoice>();
    assert_eq!(unwrap_outcome(block_on(all.get_list(&cx, &session))).len(), 1);

    let batch: Vec<Invoice> = (0..3).map(|i| invoice(&format!("B-{i}"), 1.0)).collect();
    assert_eq!(unwrap_outcome(block_on(session.bulk_insert(&cx, &batch, 0))), 3);
    assert_eq!(db.row_count("invoices"), 4);
    // The snapshot taken before the bulk insert is still served.
    assert_eq!(unwrap_outcome(block_on(all.get_list(&cx, &session))).len(), 1);

    let dropped = block_on(ctx.invalidate_type(TypeId::of::<Invoice>(), false));
    assert_eq!(dropped, vec![TypeId::of::<Invoice>()]);
    assert_eq!(unwrap_outcome(block_on(all.get_list(&cx, &session))).len(), 4);
}
