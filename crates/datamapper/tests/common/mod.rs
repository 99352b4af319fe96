#![allow(dead_code)]

use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;
use datamapper::prelude::*;
use datamapper_testkit::fixtures::{self, Invoice};
use datamapper_testkit::{MemoryDatabase, MemoryFactory, unwrap_outcome};

pub fn block_on<T>(f: impl Future<Output = T>) -> T {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

pub fn config() -> DataConfig {
    DataConfig::new()
        .dialect(Dialect::Postgres)
        .connection_string("memory://main")
}

pub fn context(db: &MemoryDatabase, config: DataConfig) -> Arc<DataContext<MemoryFactory>> {
    DataContext::new(fixtures::registry(), MemoryFactory::new(db.clone()), config)
        .expect("build data context")
}

pub fn invoice(number: &str, total: f64) -> Invoice {
    Invoice {
        number: number.to_string(),
        total,
        ..Invoice::default()
    }
}

/// Save one invoice per `(number, total)` pair and return them with identities assigned.
pub fn seed_invoices(
    cx: &Cx,
    session: &Session<MemoryFactory>,
    rows: &[(&str, f64)],
) -> Vec<Invoice> {
    rows.iter()
        .map(|(number, total)| {
            let mut inv = invoice(number, *total);
            unwrap_outcome(block_on(session.save(cx, &mut inv)));
            inv
        })
        .collect()
}

pub fn numbers(items: &[EntityRef]) -> Vec<String> {
    items
        .iter()
        .filter_map(|e| e.downcast_cloned::<Invoice>())
        .map(|i| i.number)
        .collect()
}
