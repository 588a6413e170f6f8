use criterion::{criterion_group, criterion_main, Criterion};
use folio_history::doc::DEFAULT_ROOT;
use folio_history::revert::{changes_since, reconstruct, rediff, undo_changes};
use folio_history::{
    Author, DocumentId, HistoryBackend, LiveConfig, MemoryBackend,
    RocksStore, SharedDoc, StoreConfig, SyncMessage, VersioningService,
};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

/// Document with `edits` single-word inserts, snapshot taken halfway.
fn edited_doc(edits: u32) -> (SharedDoc, Vec<u8>) {
    let doc = SharedDoc::new(DEFAULT_ROOT);
    let mut snapshot = Vec::new();
    for i in 0..edits {
        let len = doc.text().chars().count() as u32;
        doc.insert_text(len, "word ");
        if i % 3 == 0 && len > 5 {
            doc.remove_text(0, 2);
        }
        if i == edits / 2 {
            snapshot = doc.encode_snapshot();
        }
    }
    (doc, snapshot)
}

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = vec![0u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), "doc", 1, black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), "doc", 1, vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_reconstruct(c: &mut Criterion) {
    let (doc, snapshot) = edited_doc(500);

    c.bench_function("reconstruct_from_snapshot_500_edits", |b| {
        b.iter(|| {
            black_box(reconstruct(&doc, black_box(&snapshot)).unwrap());
        })
    });
}

fn bench_revert_steps(c: &mut Criterion) {
    let (doc, snapshot) = edited_doc(500);

    c.bench_function("revert_compute_500_edits", |b| {
        b.iter(|| {
            let past = reconstruct(&doc, &snapshot).unwrap();
            let changes = changes_since(&doc, &past);
            let undone = undo_changes(past, &changes).unwrap();
            black_box(rediff(&undone, &doc));
        })
    });
}

fn bench_save_version(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = VersioningService::new(Arc::new(MemoryBackend::new()), LiveConfig::default());
    let doc_id = DocumentId::parse("bench").unwrap();
    let (seed, _) = edited_doc(200);
    rt.block_on(async {
        svc.live()
            .apply_update(&doc_id, &seed.encode_full_state(), Uuid::nil())
            .await
            .unwrap();
    });

    c.bench_function("save_version_200_edits", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(svc.save_version(&doc_id, Author::new("Ann")).await.unwrap());
            });
        })
    });
}

fn bench_append_update_rocksdb(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let doc_id = DocumentId::parse("bench").unwrap();
    let update = vec![42u8; 256];

    c.bench_function("append_update_256B", |b| {
        b.iter(|| {
            black_box(store.append_update(&doc_id, black_box(&update)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_reconstruct,
    bench_revert_steps,
    bench_save_version,
    bench_append_update_rocksdb,
);
criterion_main!(benches);
