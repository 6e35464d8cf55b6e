use std::sync::Arc;

use ctn_crypto::{MasterKey, StaticKeyRing, StreamCipher, KEY_SIZE};
use tokio_util::sync::CancellationToken;

const TOTAL: usize = 8 * 1024 * 1024;

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn cipher(threads: usize) -> StreamCipher {
    let ring = StaticKeyRing::single(1, MasterKey::from_bytes([7u8; KEY_SIZE]));
    StreamCipher::new(Arc::new(ring)).with_threads(threads)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[divan::bench(args = [1, 2, 4])]
fn bench_encrypt_stream(bencher: divan::Bencher, threads: usize) {
    let rt = runtime();
    let cipher = cipher(threads);
    let data = make_data(TOTAL);
    let cancel = CancellationToken::new();
    bencher
        .counter(divan::counter::BytesCount::new(TOTAL))
        .bench(|| {
            rt.block_on(async {
                let mut out = Vec::with_capacity(TOTAL + 4096);
                cipher
                    .encrypt(&mut divan::black_box(&data[..]), &mut out, 1024 * 1024, &cancel)
                    .await
                    .unwrap();
                out
            })
        });
}

#[divan::bench(args = [1, 2, 4])]
fn bench_decrypt_stream(bencher: divan::Bencher, threads: usize) {
    let rt = runtime();
    let cipher = cipher(threads);
    let cancel = CancellationToken::new();
    let data = make_data(TOTAL);
    let container = rt.block_on(async {
        let mut out = Vec::new();
        cipher
            .encrypt(&mut &data[..], &mut out, 1024 * 1024, &cancel)
            .await
            .unwrap();
        out
    });
    bencher
        .counter(divan::counter::BytesCount::new(TOTAL))
        .bench(|| {
            rt.block_on(async {
                let mut out = Vec::with_capacity(TOTAL);
                cipher
                    .decrypt(&mut divan::black_box(&container[..]), &mut out, &cancel)
                    .await
                    .unwrap();
                out
            })
        });
}

fn main() {
    divan::main();
}
