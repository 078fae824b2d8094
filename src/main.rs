use std::sync::Arc;
use std::thread;

use clap::Parser;
use halocline::comm::LocalComm;
use halocline::device::{DeviceContext, DeviceKind};
use halocline::profile::Stopwatch;
use halocline::rpc::{Client, Master, StencilInvocation, StencilTable};
use halocline::{ElementType, GridShape, GridSpace, HaloError, IndexArray, ReduceOp, RuntimeConfig, Scalar};

/// Run a smoothing stencil over a grid split across in-process ranks
#[derive(Parser)]
#[command(name = "halocline", version)]
struct Cli {
    /// Global grid size, e.g. 64x64x32
    #[arg(long, default_value = "32x32x32")]
    size: String,

    /// Number of ranks (one thread each)
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Process grid shape, e.g. 2x2x1 (default: derived from --ranks)
    #[arg(long = "proc")]
    procs: Option<String>,

    /// Halo width in every dimension
    #[arg(long, default_value_t = 1)]
    halo: usize,

    /// Exchange corner halos
    #[arg(long)]
    diagonal: bool,

    /// Wrap halos around the domain edges
    #[arg(long)]
    periodic: bool,

    /// Use the two-stage exchange
    #[arg(long)]
    two_stage: bool,

    /// Stencil iterations
    #[arg(long, default_value_t = 10)]
    iterations: usize,

    /// Device backend: emulated or wgpu
    #[arg(long, default_value = "emulated")]
    device: String,

    /// Print per-grid copy profiles to stderr
    #[arg(long)]
    stats: bool,
}

/// Average of each point and its axis neighbors. Params: halo width,
/// diagonal, periodic, two-stage.
fn smooth(gs: &mut GridSpace, inv: &StencilInvocation) -> halocline::Result<()> {
    let id = *inv
        .grids
        .first()
        .ok_or_else(|| HaloError::Rpc("smooth needs one grid".into()))?;
    let param = |i: usize| inv.params.get(i).map_or(0.0, Scalar::as_f64);
    let width = param(0) as usize;
    let diagonal = param(1) != 0.0;
    let periodic = param(2) != 0.0;
    let two_stage = param(3) != 0.0;

    let nd = gs.grid(id)?.num_dims();
    let mut widths = [0; 3];
    widths[..nd].fill(width);
    if two_stage {
        gs.exchange_boundaries_stage1(id, &widths, &widths, diagonal, periodic)?;
        gs.exchange_boundaries_stage2(id, &widths, &widths, diagonal, periodic)?;
    } else {
        gs.exchange_boundaries(id, &widths, &widths, diagonal, periodic)?;
    }

    let grid = gs.grid_mut(id)?;
    let lo = grid.local_offset();
    let ls = grid.local_size();
    let goff = grid.global_offset();
    let size = grid.size();
    let reach = width.min(1) as i64;
    let mut out = Vec::with_capacity(grid.num_elements());
    for i2 in 0..ls[2] {
        for i1 in 0..ls[1] {
            for i0 in 0..ls[0] {
                let p = lo + IndexArray::new(i0, i1, i2);
                let mut acc = grid.read_element::<f32>(&p)?;
                let mut n = 1.0f32;
                for d in 0..nd {
                    for step in [-reach, reach] {
                        let mut q = p;
                        q[d] += step;
                        let inside = q[d] >= goff[d] && q[d] < goff[d] + size[d];
                        if step != 0 && (inside || periodic) {
                            acc += grid.read_element::<f32>(&q)?;
                            n += 1.0;
                        }
                    }
                }
                out.push(acc / n);
            }
        }
    }
    grid.copyin_local_typed(&out)
}

fn stencils() -> StencilTable {
    let mut table = StencilTable::new();
    table.register("smooth", smooth);
    table
}

fn run(cli: &Cli) -> halocline::Result<()> {
    let device: DeviceKind = cli.device.parse()?;
    let mut config = RuntimeConfig::from_size_str(&cli.size)?.with_device(device);
    if let Some(procs) = &cli.procs {
        config = config.with_proc_grid(procs.parse()?);
    }
    let config = config.with_env()?;
    let ctx = DeviceContext::from_kind(config.device)?;

    let mut comms = LocalComm::universe(cli.ranks).into_iter();
    let root = comms
        .next()
        .ok_or_else(|| HaloError::Config("at least one rank is required".into()))?;
    let clients: Vec<_> = comms
        .map(|comm| {
            let config = config.clone();
            let ctx = ctx.clone();
            thread::spawn(move || -> halocline::Result<String> {
                let space = config.build_space_on(Arc::new(comm), ctx)?;
                let space = Client::new(space, stencils()).listen()?;
                Ok(space.profile_report())
            })
        })
        .collect();

    let space = config.build_space_on(Arc::new(root), ctx)?;
    tracing::info!(procs = %space.proc_grid(), size = %config.global_size, "grid space ready");
    let mut master = Master::new(space, stencils())?;

    let shape = GridShape::new(ElementType::Float, config.num_dims, config.global_size);
    let id = master.grid_new(&shape)?;
    let n = shape.num_elements() as usize;
    let initial: Vec<f32> = (0..n).map(|i| (i % 97) as f32).collect();
    master.grid_copyin_typed(id, &initial)?;

    let flag = |b: bool| Scalar::I32(b as i32);
    let inv = StencilInvocation {
        index: 0,
        iterations: cli.iterations,
        grids: vec![id],
        params: vec![
            Scalar::I32(cli.halo as i32),
            flag(cli.diagonal),
            flag(cli.periodic),
            flag(cli.two_stage),
        ],
    };
    let sw = Stopwatch::new();
    master.run(&inv)?;
    let elapsed = sw.stop();

    let sum = master.reduce(id, ReduceOp::Sum)?;
    let max = master.reduce(id, ReduceOp::Max)?;
    let result = master.grid_copyout_typed::<f32>(id)?;
    println!("elements: {}", sum.num_elements);
    println!("sum: {}", sum.value);
    println!("max: {}", max.value);
    println!("first: {:?}", &result[..result.len().min(4)]);
    let space = master.finalize()?;

    let mut reports = vec![space.profile_report()];
    for handle in clients {
        let report = handle
            .join()
            .map_err(|_| HaloError::Comm("client thread panicked".into()))??;
        reports.push(report);
    }
    if cli.stats {
        eprintln!("{} iterations in {:.3?}", cli.iterations, elapsed);
        for report in reports {
            eprint!("{report}");
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
