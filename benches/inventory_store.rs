//! Benchmark for the inventory store
//!
//! Target: 10K VM updates/sec on a 10K-VM inventory

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use forklift_controller::inventory::model::vsphere::{VM_CPUS, VM_POWER_STATE};
use forklift_controller::inventory::model::{Model, Ref, Vm};
use forklift_controller::inventory::{ListOptions, Page, Store};
use serde_json::json;
use std::sync::Arc;

fn vm(i: u64) -> Vm {
    let mut vm = Vm::with_id(&format!("vm-{}", i));
    vm.base.name = format!("vm-{:05}", i);
    vm.base.parent = Ref::new("Folder", format!("group-v{}", i % 10));
    vm.base.object.insert(VM_CPUS.into(), json!(2));
    vm.base.object.insert(VM_POWER_STATE.into(), json!("poweredOn"));
    vm
}

fn populated(n: u64) -> Store {
    let store = Store::new("bench");
    for i in 0..n {
        let _ = store.insert(&mut vm(i));
    }
    store
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("inventory_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_vm", |b| {
        let store = Store::new("bench");
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let _ = store.insert(black_box(&mut vm(counter)));
        });
    });

    group.finish();
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("inventory_store");
    group.throughput(Throughput::Elements(1));

    let store = populated(10_000);
    group.bench_function("update_vm", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            if let Ok(mut m) = store.find::<Vm>(&format!("vm-{}", counter % 10_000)) {
                m.base.object.insert(VM_POWER_STATE.into(), json!(if counter % 2 == 0 { "poweredOn" } else { "poweredOff" }));
                let _ = store.update(black_box(&mut m));
            }
        });
    });

    group.finish();
}

fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("inventory_store");
    group.throughput(Throughput::Elements(100));

    let store = populated(10_000);
    group.bench_function("list_page_100", |b| {
        let mut page = 0usize;
        b.iter(|| {
            page = (page + 1) % 100;
            let opts = ListOptions::default().with_page(Page::new(page, 100));
            let _ = store.list::<Vm>(black_box(&opts));
        });
    });

    group.bench_function("list_by_parent", |b| {
        let opts = ListOptions::default().with_parent(Ref::new("Folder", "group-v3"));
        b.iter(|| {
            let _ = store.list::<Vm>(black_box(&opts));
        });
    });

    group.finish();
}

fn bench_concurrent_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("inventory_store");
    group.throughput(Throughput::Elements(100));

    let store = Arc::new(populated(1_000));
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_finds", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let store = store.clone();
                    handles.push(tokio::spawn(async move {
                        let _ = store.find::<Vm>(&format!("vm-{}", i % 1000));
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_update, bench_list, bench_concurrent_readers);
criterion_main!(benches);
