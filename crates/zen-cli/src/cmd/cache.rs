use clap::Subcommand;

use crate::app::App;
use crate::output::print_structured;

#[derive(Subcommand)]
pub enum CacheSubcommand {
    /// Show size, entry count and hit ratio
    Info,

    /// Drop every cached entry (sync links and conflicts are kept)
    Clear,

    /// Evict expired entries
    Cleanup,
}

pub fn run(app: &App, subcmd: CacheSubcommand) -> anyhow::Result<()> {
    let cache = app.open_cache()?;
    match subcmd {
        CacheSubcommand::Info => {
            let info = cache.info();
            if app.format.is_structured() {
                return print_structured(app.format, &info);
            }
            println!("path:      {}", info.base_path.display());
            println!("entries:   {}", info.entry_count);
            if info.size_limit_bytes > 0 {
                println!(
                    "size:      {} / {} bytes",
                    info.total_bytes, info.size_limit_bytes
                );
            } else {
                println!("size:      {} bytes (unbounded)", info.total_bytes);
            }
            println!(
                "hits:      {} hit / {} miss ({:.1}%)",
                info.hit_count,
                info.miss_count,
                info.hit_ratio * 100.0
            );
        }
        CacheSubcommand::Clear => {
            cache.clear()?;
            if app.format.is_structured() {
                return print_structured(app.format, &serde_json::json!({ "cleared": true }));
            }
            println!("cache cleared: {}", cache.base_path().display());
        }
        CacheSubcommand::Cleanup => {
            let evicted = cache.cleanup()?;
            if app.format.is_structured() {
                return print_structured(app.format, &serde_json::json!({ "evicted": evicted }));
            }
            println!("evicted {evicted} expired entries");
        }
    }
    Ok(())
}
