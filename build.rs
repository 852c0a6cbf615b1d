use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

struct ClassDef {
    size: usize,
    batch_size: usize,
}

/// Objects moved per batch: amortize one lock acquisition over roughly
/// 64 KiB of traffic, floor 2 (a batch must at least pair head and tail).
fn auto_batch(size: usize) -> usize {
    (65536 / size).clamp(2, 32)
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    max_capacity_in_batches: Option<usize>,
    initial_capacity_in_batches: Option<usize>,
    class_byte_budget: Option<usize>,
    resize_fraction: Option<f64>,
    max_cpus: Option<usize>,
    sharded_min_size: Option<usize>,
    sharded_class_byte_budget: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
    #[serde(default, rename = "class")]
    class_full: Vec<ClassFull>,
}

#[derive(Deserialize)]
struct ClassFull {
    size: usize,
    batch_size: Option<usize>,
}

struct ResolvedConfig {
    max_capacity_in_batches: usize,
    initial_capacity_in_batches: usize,
    class_byte_budget: usize,
    resize_fraction: f64,
    max_cpus: usize,
    sharded_min_size: usize,
    sharded_class_byte_budget: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let max_capacity_in_batches = cfg.max_capacity_in_batches.unwrap_or(64);
    let initial_capacity_in_batches = cfg.initial_capacity_in_batches.unwrap_or(16);
    let class_byte_budget = cfg.class_byte_budget.unwrap_or(1024 * 1024);
    let resize_fraction = cfg.resize_fraction.unwrap_or(0.1);
    let max_cpus = cfg.max_cpus.unwrap_or(1024);
    let sharded_min_size = cfg.sharded_min_size.unwrap_or(4096);
    let sharded_class_byte_budget = cfg.sharded_class_byte_budget.unwrap_or(12 << 20);

    assert!(
        max_capacity_in_batches > 0,
        "max_capacity_in_batches must be > 0"
    );
    assert!(
        initial_capacity_in_batches > 0
            && initial_capacity_in_batches <= max_capacity_in_batches,
        "initial_capacity_in_batches ({}) must be in 1..=max_capacity_in_batches ({})",
        initial_capacity_in_batches,
        max_capacity_in_batches
    );
    assert!(class_byte_budget > 0, "class_byte_budget must be > 0");
    assert!(
        resize_fraction > 0.0 && resize_fraction <= 1.0,
        "resize_fraction ({}) must be in (0, 1]",
        resize_fraction
    );
    assert!(max_cpus > 0, "max_cpus must be > 0");
    assert!(sharded_min_size > 0, "sharded_min_size must be > 0");
    assert!(
        sharded_class_byte_budget > 0,
        "sharded_class_byte_budget must be > 0"
    );

    ResolvedConfig {
        max_capacity_in_batches,
        initial_capacity_in_batches,
        class_byte_budget,
        resize_fraction,
        max_cpus,
        sharded_min_size,
        sharded_class_byte_budget,
    }
}

fn parse_classes(config: &Config) -> Vec<ClassDef> {
    if !config.classes.is_empty() && !config.class_full.is_empty() {
        panic!("XFERCACHE_CONFIG: use either `classes = [...]` or `[[class]]`, not both");
    }

    let defs: Vec<ClassDef> = if !config.classes.is_empty() {
        config
            .classes
            .iter()
            .map(|&s| ClassDef {
                size: s,
                batch_size: auto_batch(s),
            })
            .collect()
    } else if !config.class_full.is_empty() {
        config
            .class_full
            .iter()
            .map(|c| ClassDef {
                size: c.size,
                batch_size: c.batch_size.unwrap_or_else(|| auto_batch(c.size)),
            })
            .collect()
    } else {
        panic!("XFERCACHE_CONFIG: config must contain `classes` or `[[class]]` entries");
    };

    validate_classes(&defs);
    defs
}

fn validate_classes(defs: &[ClassDef]) {
    assert!(!defs.is_empty(), "XFERCACHE_CONFIG: no size classes defined");
    assert!(
        defs.len() < 255,
        "XFERCACHE_CONFIG: too many classes ({}, max 254)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.size > 0, "class {}: size must be > 0", i);
        assert!(
            d.size % 8 == 0,
            "class {}: size {} must be 8-byte aligned",
            i,
            d.size
        );
        assert!(
            d.batch_size >= 2,
            "class {}: batch_size {} must be >= 2",
            i,
            d.batch_size
        );
        assert!(
            d.batch_size <= 4096,
            "class {}: batch_size {} is unreasonably large",
            i,
            d.batch_size
        );
        if i > 0 {
            assert!(
                d.size > defs[i - 1].size,
                "class {}: size {} must be > previous size {}",
                i,
                d.size,
                defs[i - 1].size
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/xfercache.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, defs: &[ClassDef], out_path: &Path) {
    // Class count includes the index-0 sentinel, matching SIZE_CLASSES.
    let num_classes = defs.len() + 1;
    let max_classes_to_resize =
        ((num_classes as f64 * cfg.resize_fraction) as usize).max(1);
    let max_objects_to_move = defs.iter().map(|d| d.batch_size).max().unwrap();

    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const MAX_CAPACITY_IN_BATCHES: usize = {};\n\
         pub const INITIAL_CAPACITY_IN_BATCHES: usize = {};\n\
         pub const CLASS_BYTE_BUDGET: usize = {};\n\
         pub const MAX_CLASSES_TO_RESIZE: usize = {};\n\
         pub const MAX_OBJECTS_TO_MOVE: usize = {};\n\
         pub const MAX_CPUS: usize = {};\n\
         pub const SHARDED_MIN_SIZE: usize = {};\n\
         pub const SHARDED_CLASS_BYTE_BUDGET: usize = {};\n",
        cfg.max_capacity_in_batches,
        cfg.initial_capacity_in_batches,
        cfg.class_byte_budget,
        max_classes_to_resize,
        max_objects_to_move,
        cfg.max_cpus,
        cfg.sharded_min_size,
        cfg.sharded_class_byte_budget,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, batch_size: 0 }}, // sentinel\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, batch_size: {} }},\n",
            d.size, d.batch_size
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=XFERCACHE_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("XFERCACHE_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config);

    generate_config(&resolved, &defs, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}
