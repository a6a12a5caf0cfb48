use calypso_lts::config::Config;
use calypso_lts::logging;
use calypso_lts::{DecryptKey, Error, KeyPair, LocalCluster, LtsId, Read, Write};

use std::time::{Duration, Instant};

const POLICY: &[u8] = b"calypso-bench-policy";
const BATCH: usize = 8;

#[derive(Default, Clone, Debug)]
struct Timings {
    total: Duration,
    dkg: Duration,
    write: Duration,
    reencrypt: Duration,
    reencrypt_paused: Duration,
    batch: Duration,
}

fn add(a: &mut Duration, b: Duration) { *a += b; }

fn avg(d: Duration, n: usize) -> Duration {
    if n == 0 { d } else { Duration::from_nanos((d.as_nanos() / n as u128) as u64) }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

async fn run_once(n: usize, cfg: &Config) -> Result<(Timings, bool), Error> {
    let total_start = Instant::now();
    let mut tm = Timings::default();
    let cluster = LocalCluster::builder(n).config(cfg.clone()).build()?;
    let roster = cluster.roster();

    let t = Instant::now();
    let lts = cluster.node(0).create_lts(LtsId::random(), &roster).await?;
    tm.dkg = t.elapsed();

    let reader = KeyPair::random();
    let key = b"bench symmetric key 0123456789";

    let t = Instant::now();
    let write = Write::with_document(lts.lts_id, POLICY, &lts.x, &key[..24], b"payload")?;
    tm.write = t.elapsed();
    let req = DecryptKey::with_read_proof(write.clone(), Read::new(&write, reader.public))?;

    let t = Instant::now();
    let reply = cluster.node(0).decrypt_key(&req).await?;
    tm.reencrypt = t.elapsed();
    let recovered = reply.recover_key(&reader.private)?;
    let mut ok = recovered == key[..24];
    ok &= write.open_document(&recovered)? == b"payload";

    // up to n - t nodes may be down
    let down = n - roster.threshold();
    for i in 0..down {
        cluster.pause(n - 1 - i);
    }
    let t = Instant::now();
    let reply = cluster.node(0).decrypt_key(&req).await?;
    tm.reencrypt_paused = t.elapsed();
    ok &= reply.recover_key(&reader.private)? == key[..24];
    for i in 0..down {
        cluster.resume(n - 1 - i);
    }

    let mut reqs = Vec::with_capacity(BATCH);
    for k in 0..BATCH {
        let w = Write::new(lts.lts_id, POLICY, &lts.x, &[k as u8; 16])?;
        reqs.push(DecryptKey::with_read_proof(w.clone(), Read::new(&w, reader.public))?);
    }
    let t = Instant::now();
    let replies = cluster.node(0).decrypt_keys(&reqs).await?;
    tm.batch = t.elapsed();
    for (k, r) in replies.into_iter().enumerate() {
        ok &= r?.recover_key(&reader.private)? == [k as u8; 16];
    }

    tm.total = total_start.elapsed();
    Ok((tm, ok))
}

async fn run_exp(n: usize, reps: usize, cfg: &Config) {
    let mut sum = Timings::default();
    let mut ok = true;

    for _ in 0..reps {
        match run_once(n, cfg).await {
            Ok((tm, good)) => {
                ok &= good;
                add(&mut sum.total, tm.total);
                add(&mut sum.dkg, tm.dkg);
                add(&mut sum.write, tm.write);
                add(&mut sum.reencrypt, tm.reencrypt);
                add(&mut sum.reencrypt_paused, tm.reencrypt_paused);
                add(&mut sum.batch, tm.batch);
            }
            Err(e) => {
                tracing::warn!(n, error = %e, "run failed");
                ok = false;
            }
        }
    }

    println!(
        "RESULT,n={},t={},reps={},batch={},ok={},total_ms={:.3},dkg_ms={:.3},write_ms={:.3},reencrypt_ms={:.3},reencrypt_paused_ms={:.3},batch_ms={:.3}",
        n, n - (n - 1) / 3, reps, BATCH, ok,
        ms(avg(sum.total, reps)),
        ms(avg(sum.dkg, reps)),
        ms(avg(sum.write, reps)),
        ms(avg(sum.reencrypt, reps)),
        ms(avg(sum.reencrypt_paused, reps)),
        ms(avg(sum.batch, reps)),
    );
}

#[tokio::main]
async fn main() {
    logging::init();
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("bad config: {e}");
            std::process::exit(1);
        }
    };
    let reps = 5;

    for n in [4, 7, 10, 16, 25] {
        run_exp(n, reps, &cfg).await;
    }
}
