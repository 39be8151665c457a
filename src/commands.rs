use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::warn;
use rgdl::{RegionDownloadState, RegionDownloader, RegionEntry, RegionListener, Status};

use crate::cli::StatusFilter;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";

/// Renders region events as one progress bar per region below a summary line.
struct ProgressListener {
    multi_progress: MultiProgress,
    header_pb: ProgressBar,
    bars: Mutex<HashMap<String, ProgressBar>>,
    total_regions: usize,
    finished: Mutex<(usize, usize)>,
}

impl ProgressListener {
    fn new(total_regions: usize) -> Self {
        let multi_progress = MultiProgress::new();
        multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header_pb = multi_progress.add(ProgressBar::new(0));
        header_pb.set_style(plain_style());
        header_pb.set_message(format!("Summary: Regions: 0/{} | Failed: 0", total_regions));

        Self {
            multi_progress,
            header_pb,
            bars: Mutex::new(HashMap::new()),
            total_regions,
            finished: Mutex::new((0, 0)),
        }
    }

    fn bar(&self, region: &RegionEntry) -> ProgressBar {
        let mut bars = match self.bars.lock() {
            Ok(bars) => bars,
            Err(poisoned) => poisoned.into_inner(),
        };
        bars.entry(region.path.clone())
            .or_insert_with(|| {
                let pb = self.multi_progress.add(ProgressBar::new(0));
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template(BAR_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                pb
            })
            .clone()
    }

    fn record_finish(&self, failed: bool) {
        let mut finished = match self.finished.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        finished.0 += 1;
        if failed {
            finished.1 += 1;
        }
        self.header_pb.set_message(format!(
            "Summary: Regions: {}/{} | Failed: {}",
            finished.0, self.total_regions, finished.1
        ));
        self.header_pb.tick();
    }
}

impl RegionListener for ProgressListener {
    fn on_progress(&self, region: &RegionEntry, state: &RegionDownloadState) {
        let pb = self.bar(region);
        pb.set_length(state.bytes_total());
        pb.set_position(state.bytes_downloaded());
        pb.set_message(format!(
            "{} (tiles {}/{})",
            region.display_name, state.tiles_downloaded, state.tiles_total
        ));
    }

    fn on_complete(&self, region: &RegionEntry, state: &RegionDownloadState) {
        let pb = self.bar(region);
        pb.set_length(state.bytes_total());
        pb.set_position(state.bytes_total());
        pb.finish_with_message(format!(
            "Completed   {} (tiles {}/{})",
            region.display_name, state.tiles_downloaded, state.tiles_total
        ));
        self.record_finish(false);
    }

    fn on_error(&self, region: &RegionEntry, message: &str) {
        self.bar(region)
            .abandon_with_message(format!("Failed      {}: {}", region.display_name, message));
        self.record_finish(true);
    }
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub fn list_continents(downloader: &RegionDownloader) -> Result<()> {
    let continents = downloader.catalog().list_continents();
    if continents.is_empty() {
        println!("No regions available. Check the catalog file.");
        return Ok(());
    }
    for continent in continents {
        let regions = downloader.catalog().list_regions(&continent);
        let completed = regions
            .iter()
            .filter(|r| downloader.state(&r.path).status == Status::Completed)
            .count();
        println!("{:<25} {:>4} regions {:>4} downloaded", continent, regions.len(), completed);
    }
    Ok(())
}

pub fn list_regions(downloader: &RegionDownloader, continent: &str, show: StatusFilter) -> Result<()> {
    let regions = downloader.catalog().list_regions(continent);
    if regions.is_empty() {
        bail!("Unknown continent {:?}", continent);
    }

    println!("{:<45} {:<30} {:<15} {:<10} {:<15}", "Path", "Name", "Status", "Progress", "Size");
    println!("{:-<45} {:-<30} {:-<15} {:-<10} {:-<15}", "", "", "", "", "");

    for region in regions {
        let state = downloader.state(&region.path);
        if !show.matches(state.status) {
            continue;
        }
        let name = if region.is_leaf {
            region.display_name.clone()
        } else {
            format!("{} (all)", region.display_name)
        };
        print_state_row(&region.path, &name, &state);
    }
    Ok(())
}

fn print_state_row(path: &str, name: &str, state: &RegionDownloadState) {
    println!(
        "{:<45} {:<30} {:<15} {:<10} {:<15}",
        path,
        name,
        state.status.label(),
        format!("{:.2}%", state.overall_fraction() * 100.0),
        format!("{}", HumanBytes(state.bytes_total()))
    );
}

pub fn show_status(downloader: &RegionDownloader, region: Option<&str>) -> Result<()> {
    if let Some(path) = region {
        let entry = downloader.region(path);
        let state = downloader.state(path);
        println!("{} ({})", entry.display_name, entry.path);
        println!("  Status:    {}", state.status.label());
        for (label, progress) in [("Map", state.map), ("POI", state.poi), ("Boundary", state.boundary)] {
            println!(
                "  {:<10} {} / {} ({:.2}%)",
                format!("{}:", label),
                HumanBytes(progress.downloaded),
                HumanBytes(progress.total),
                progress.fraction() * 100.0
            );
        }
        println!("  Tiles:     {}/{}", state.tiles_downloaded, state.tiles_total);
        if let Some(updated) = state.updated_at {
            println!("  Updated:   {}", updated.format("%Y-%m-%d %H:%M"));
        }
        if let Some(error) = &state.last_error {
            println!("  Error:     {}", error);
        }
        return Ok(());
    }

    let states: Vec<_> = downloader
        .states()
        .into_iter()
        .filter(|(_, s)| s.status != Status::NotDownloaded)
        .collect();

    let completed = states.iter().filter(|(_, s)| s.status == Status::Completed).count();
    let downloaded: u64 = states.iter().map(|(_, s)| s.bytes_downloaded()).sum();
    let known: u64 = states.iter().map(|(_, s)| s.bytes_total()).sum();
    println!(
        "Summary: Regions: {}/{} | Downloaded: {} / {}",
        completed,
        states.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();

    if states.is_empty() {
        println!("No regions downloaded yet in {:?}.", downloader.config().data_dir);
        return Ok(());
    }

    println!("{:<45} {:<30} {:<15} {:<10} {:<15}", "Path", "Name", "Status", "Progress", "Size");
    println!("{:-<45} {:-<30} {:-<15} {:-<10} {:-<15}", "", "", "", "", "");
    for (path, state) in &states {
        print_state_row(path, &downloader.region(path).display_name, state);
    }
    Ok(())
}

pub async fn run_downloads(downloader: &RegionDownloader, paths: &[String]) -> Result<()> {
    let listener = Arc::new(ProgressListener::new(paths.len()));

    let mut started = Vec::with_capacity(paths.len());
    for path in paths {
        let region = downloader.region(path);
        if downloader.catalog().find(path).is_none() {
            warn!("{} is not in the catalog, trying anyway", path);
        }
        if downloader.start(&region, listener.clone()).await? {
            started.push(region.path);
        }
    }

    let pauser = downloader.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Pausing downloads, run the same command again to resume");
            pauser.cancel_all().await;
        }
    });

    for path in &started {
        downloader.join(path).await;
    }
    ctrl_c.abort();

    let failed: Vec<_> = started
        .iter()
        .filter(|path| matches!(downloader.state(path).status, Status::Error | Status::Partial))
        .collect();
    if !failed.is_empty() {
        bail!("{} region(s) did not complete: {:?}", failed.len(), failed);
    }
    Ok(())
}

pub async fn delete_regions(downloader: &RegionDownloader, paths: &[String]) -> Result<()> {
    for path in paths {
        downloader.delete(path).await?;
        println!("Deleted {}", path);
    }
    Ok(())
}
