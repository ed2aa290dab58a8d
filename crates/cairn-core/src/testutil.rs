use tempfile::TempDir;

use crate::config::{ChunkingConfig, PackfileConfig};
use crate::context::AppContext;
use crate::crypto::KdfParams;
use crate::repo::{CreateOptions, Repository};
use crate::storage::StoreRegistry;

/// A test environment: temp cache dir, context, and a default registry.
pub struct TestEnv {
    _cache_dir: TempDir,
    pub ctx: AppContext,
    pub registry: StoreRegistry,
}

pub fn test_env() -> TestEnv {
    let cache_dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(cache_dir.path()).with_max_concurrency(2);
    TestEnv {
        _cache_dir: cache_dir,
        ctx,
        registry: StoreRegistry::with_defaults(),
    }
}

/// Small sizes so tests produce multiple chunks and packfiles from little
/// data, and cheap KDF parameters for encrypted fixtures.
pub fn small_create_options(passphrase: Option<&str>) -> CreateOptions {
    let mut kdf = KdfParams::generate();
    kdf.time_cost = 1;
    kdf.memory_cost = 8192;
    kdf.parallelism = 1;

    CreateOptions {
        passphrase: passphrase.map(str::to_string),
        chunking: ChunkingConfig {
            algorithm: "fastcdc".into(),
            min_size: 256,
            normal_size: 1024,
            max_size: 4096,
        },
        packfile: PackfileConfig { max_size: 16 * 1024 },
        kdf: Some(kdf),
        ..CreateOptions::default()
    }
}

pub fn create_repo(env: &TestEnv, location: &str, passphrase: Option<&str>) -> Repository {
    Repository::create(
        &env.ctx,
        &env.registry,
        location,
        small_create_options(passphrase),
    )
    .unwrap()
}

/// Deterministic pseudo-random bytes for dedup and chunking fixtures.
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
