use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::{info, LevelFilter};
use utils::test_utils::generate_random_batch;
use vq::quantizer::{VectorQuantizer, VectorQuantizerConfig};
use vq::storage::VectorQuantizerWriter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value_t = 64)]
    num_codes: usize,

    #[arg(long, default_value_t = 16)]
    dim: usize,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    #[arg(long, default_value_t = 100)]
    steps: usize,

    #[arg(long, default_value_t = 0.25)]
    commitment_cost: f32,

    #[arg(long, default_value_t = 0.99)]
    ema_decay: f32,

    #[arg(long)]
    no_rotation: bool,

    /// Directory to persist the trained codebook into, if given
    #[arg(long)]
    output_dir: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let arg = Args::parse();
    let config = VectorQuantizerConfig {
        num_codes: arg.num_codes,
        dim: arg.dim,
        commitment_cost: arg.commitment_cost,
        use_rotation: !arg.no_rotation,
        ema_decay: arg.ema_decay,
    };
    let mut quantizer = VectorQuantizer::new(config)?;

    info!("=========== Training ===========");
    let start = Instant::now();
    for step in 0..arg.steps {
        let batch = generate_random_batch(arg.batch_size, arg.dim);
        let result = quantizer.forward(batch.view())?;
        if step % 10 == 0 || step + 1 == arg.steps {
            info!(
                "Step {}: loss {:.6}, perplexity {:.2}",
                step, result.loss, result.perplexity
            );
        }
    }
    info!("Trained {} steps in {:?}", arg.steps, start.elapsed());

    quantizer.set_training(false);
    let batch = generate_random_batch(arg.batch_size, arg.dim);
    let result = quantizer.forward(batch.view())?;
    info!(
        "Eval batch: loss {:.6}, perplexity {:.2} over {} codes",
        result.loss,
        result.perplexity,
        quantizer.config().num_codes
    );

    if let Some(output_dir) = arg.output_dir {
        VectorQuantizerWriter::new(output_dir.clone()).write(&quantizer)?;
        info!("Saved quantizer state to {}", output_dir);
    }

    Ok(())
}
