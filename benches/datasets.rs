use blockquery::{Block, BlockBuilder, FloatEncoding, Labels, Sample};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_SEED: u64 = 0x_424C_4B51_5259_4245; // fixed seed for stable benchmarks

#[derive(Clone, Debug)]
pub struct BlockShape {
    pub min_time: i64,
    pub max_time: i64,
    pub series: usize,
    pub label_pairs: usize,
    pub label_cardinality: u32,
    pub scrape_interval: i64,
    pub row_group_size: usize,
    pub data_col_duration: i64,
}

impl Default for BlockShape {
    fn default() -> Self {
        Self {
            min_time: 0,
            max_time: 2 * 60 * 60 * 1000,
            series: 2_000,
            label_pairs: 4,
            label_cardinality: 16,
            scrape_interval: 15_000,
            row_group_size: 256,
            data_col_duration: 30 * 60 * 1000,
        }
    }
}

/// Builds a block of random-walk series. Every series carries `job="job_<i % 8>"` and
/// `series="<i>"` plus `label_pairs` random `k<n>="v<m>"` labels.
pub fn generate_block(seed: u64, shape: &BlockShape, encoding: FloatEncoding) -> Block {
    assert!(shape.series > 0);
    assert!(shape.label_cardinality > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut b = BlockBuilder::new(shape.min_time, shape.max_time)
        .with_row_group_size(shape.row_group_size)
        .with_data_col_duration(shape.data_col_duration)
        .with_float_encoding(encoding);

    for i in 0..shape.series {
        let mut pairs = vec![
            ("job".to_string(), format!("job_{}", i % 8)),
            ("series".to_string(), i.to_string()),
        ];
        for k in 0..shape.label_pairs {
            let v = rng.random_range(0..shape.label_cardinality);
            pairs.push((format!("k{}", k), format!("v{}", v)));
        }

        let mut value = rng.random::<u32>() as f64 * 0.001;
        let samples = (shape.min_time..shape.max_time)
            .step_by(shape.scrape_interval as usize)
            .map(|t| {
                value += rng.random_range(-1.0..1.0);
                Sample::new(t, value)
            })
            .collect();
        b.add_samples(Labels::new(pairs), samples).expect("add series");
    }

    b.build_block().expect("build block")
}
