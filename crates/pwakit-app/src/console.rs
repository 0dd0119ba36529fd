//! Terminal rendering of the page UI.

use std::io::Write;

use pwakit_page::{Banner, BannerKind, PageUi};
use tokio::sync::mpsc;

/// Prints banners to stdout and turns reloads into a signal for the host loop.
pub struct ConsoleUi {
    reload_tx: mpsc::UnboundedSender<()>,
}

impl ConsoleUi {
    pub fn new(reload_tx: mpsc::UnboundedSender<()>) -> Self {
        Self { reload_tx }
    }
}

impl PageUi for ConsoleUi {
    fn show_banner(&self, banner: &Banner) {
        match banner.kind() {
            BannerKind::Waiting => {
                println!("\n[update] {}  (u = update now, d = dismiss)", banner.message());
            }
            BannerKind::Version => {
                println!("\n[update] {}", banner.message());
            }
        }
    }

    fn update_countdown(&self, seconds_left: u64) {
        print!("\r[update] Reloading in {seconds_left}s... ");
        let _ = std::io::stdout().flush();
    }

    fn hide_banner(&self, kind: BannerKind) {
        println!("\n[update] {kind:?} banner hidden");
    }

    fn reload(&self) {
        println!("\n[page] Reloading");
        // The host loop is gone only during shutdown.
        let _ = self.reload_tx.send(());
    }
}
