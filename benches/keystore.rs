use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use confcompute::prelude::*;

struct FixedSeedTransport;

impl SessionTransport for FixedSeedTransport {
    fn attest(&self, _timeout: Duration) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::Accepted {
            seed: vec![0x77; 48],
        })
    }
}

fn loaded_store() -> Arc<KeyStore> {
    let engine = CcEngine::construct(
        confcompute::variant::raw::CC2_HOST,
        Arc::new(FixedSeedTransport),
        CcEngineConfig::default(),
    );
    let mut lifecycle = EngineLifecycle::new(engine, DeviceLock::new());
    lifecycle.state_pre_init().unwrap();
    lifecycle.state_init().unwrap();
    lifecycle.state_load(PhaseFlags::NONE).unwrap();
    lifecycle.state_post_load(PhaseFlags::NONE).unwrap();
    let store = lifecycle.participant().keystore().clone();
    store.derive_secrets(KeySpace::Lce(0)).unwrap();
    store
}

fn bench_retrieve(c: &mut Criterion) {
    let store = loaded_store();
    let id = GlobalKeyId::new(KeySpace::Lce(0), LocalKeyId::HostToDeviceUser);
    c.bench_function("retrieve_via_key_id", |b| {
        b.iter(|| store.retrieve_via_key_id(std::hint::black_box(id)).unwrap())
    });
}

fn bench_rederive(c: &mut Criterion) {
    let store = loaded_store();
    let id = GlobalKeyId::new(KeySpace::Lce(0), LocalKeyId::DeviceToHostUser);
    c.bench_function("update_key", |b| {
        b.iter(|| store.update_key(std::hint::black_box(id)).unwrap())
    });
}

criterion_group!(benches, bench_retrieve, bench_rederive);
criterion_main!(benches);
