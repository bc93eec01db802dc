use clap::Parser as ClapParser;
use std::{process, sync::Arc, thread, time::Instant};

use domus::{
    Domain, DomainGuard, DomainRegistry, DomainSettings, ObjectId, Program, RegistrySettings,
    Result, Value,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Stress driver for domain heaps", long_about = None)]
struct Cli {
    /// Worker threads hopping between domains
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Domains created next to the default one
    #[arg(short, long, default_value_t = 3)]
    domains: usize,

    /// Stays each worker makes
    #[arg(short, long, default_value_t = 200)]
    iterations: usize,

    /// Values allocated per stay
    #[arg(short, long, default_value_t = 64)]
    allocations: usize,

    /// Lower clamp of the collection threshold
    #[arg(long, default_value_t = 1024)]
    min_threshold: usize,

    /// Members of the root object each domain keeps
    #[arg(long, default_value_t = 8)]
    members: usize,
}

struct Site {
    domain: Arc<Domain>,
    globals: ObjectId,
}

// xorshift64, enough to spread workers over domains
struct Rng(u64);

impl Rng {
    fn next(&mut self, bound: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % bound as u64) as usize
    }
}

fn work(guard: &mut DomainGuard<'_>, site: &Site, allocations: usize, rng: &mut Rng) {
    let members = guard
        .object(site.globals)
        .map_or(0, |obj| obj.members().len());
    let mut previous = Value::nil();
    for i in 0..allocations {
        let value = match i % 3 {
            0 => guard.alloc_string(format!("value {i}")).as_value(),
            1 => guard.alloc_array(vec![previous, Value::from_fixnum(i as i64)]).as_value(),
            _ => guard
                .alloc_mapping(vec![(Value::from_fixnum(i as i64), previous)])
                .as_value(),
        };
        previous = value;
        if members > 0 && rng.next(8) == 0 {
            if let Some(obj) = guard.object_mut(site.globals) {
                obj.set_member(rng.next(members), value);
            }
        }
        guard.safepoint();
    }
}

fn run(cli: &Cli) -> Result<()> {
    let registry = DomainRegistry::init(RegistrySettings {
        domain: DomainSettings {
            min_collect_threshold: cli.min_threshold,
            max_collect_threshold: cli.min_threshold.max(4 * 1024 * 1024),
            ..Default::default()
        },
        ..Default::default()
    })?;

    let program = Arc::new(Program::new("Globals", cli.members));
    let mut sites = Vec::with_capacity(cli.domains + 1);
    sites.push(registry.default_domain()?);
    for i in 0..cli.domains {
        sites.push(registry.create_domain(Some(format!("worker-{i}").as_str()))?);
    }
    let sites: Arc<Vec<Site>> = Arc::new(
        sites
            .into_iter()
            .map(|domain| {
                let globals = domain.enter().instantiate(program.clone());
                Site { domain, globals }
            })
            .collect(),
    );

    let start = Instant::now();
    let workers: Vec<_> = (0..cli.threads)
        .map(|t| {
            let sites = sites.clone();
            let (iterations, allocations) = (cli.iterations, cli.allocations);
            thread::spawn(move || {
                let mut rng = Rng(0x9E37_79B9_7F4A_7C15 ^ (t as u64 + 1));
                for _ in 0..iterations {
                    let here = &sites[rng.next(sites.len())];
                    let there = &sites[rng.next(sites.len())];
                    here.domain.run(|g| {
                        work(g, here, allocations, &mut rng);
                        if !Arc::ptr_eq(&here.domain, &there.domain) {
                            g.switch_to(&there.domain, |g2| {
                                work(g2, there, allocations / 2, &mut rng);
                            });
                        }
                        work(g, here, allocations / 4, &mut rng);
                    });
                }
            })
        })
        .collect();

    for worker in workers {
        if worker.join().is_err() {
            eprintln!("worker thread panicked");
            process::exit(1);
        }
    }
    let elapsed = start.elapsed();

    for snapshot in registry.snapshots() {
        println!("{snapshot}");
    }
    println!(
        "{} threads x {} stays in {:?}",
        cli.threads, cli.iterations, elapsed
    );

    for site in sites.iter() {
        let mut g = site.domain.enter();
        g.leave_object(site.globals);
        let stats = g.collect();
        log::info!(
            "{}: {} values left after releasing globals",
            site.domain.name(),
            stats.survivors
        );
    }
    for site in sites.iter().skip(1) {
        registry.destroy_domain(&site.domain)?;
    }
    registry.shutdown();
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
