use rand::Rng;
use tilecache::{CacheResult, TileCacheProvider};
use tilecache_int_test::test_util::{at_importance, buffer, cleanup, create_test_context, tile};

fn main() -> CacheResult<()> {
    colog::init();
    println!("Starting stress test...");
    let ctx = create_test_context()?;
    let cache = ctx.file_cache()?;
    let mut rng = rand::rng();

    let count = 200_000;
    let start = std::time::Instant::now();
    for _ in 0..count {
        let key = tile(rng.random_range(-5_000..5_000), rng.random_range(-5_000..5_000));
        let importance = rng.random_range(0..4u8);
        let len = rng.random_range(64..4_096usize);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        cache.write_data_to_cache(&key, &[buffer(&key, importance, data)], 0);
    }
    let elapsed = start.elapsed();
    println!("Wrote {} tiles in {:?}", count, elapsed);

    let start = std::time::Instant::now();
    let mut hits = 0;
    for _ in 0..count {
        let key = tile(rng.random_range(-5_000..5_000), rng.random_range(-5_000..5_000));
        if cache
            .get_data_from_cache(&at_importance(&key, rng.random_range(0..4u8)))
            .is_some()
        {
            hits += 1;
        }
    }
    let elapsed = start.elapsed();
    println!("Read {} tiles ({} hits) in {:?}", count, hits, elapsed);

    let stats = cache.stats();
    println!(
        "Rotations: {}, stale evictions: {}, loaded nodes: {}, entries: {}",
        stats.page_rotations, stats.stale_evictions, stats.loaded_nodes, stats.index_entries
    );

    cache.close();
    drop(cache);
    cleanup(ctx)
}
