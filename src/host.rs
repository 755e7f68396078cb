//! Host services for the command-line runner: no real windows, notifications
//! printed to stdout.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Mutex;
use tracing::info;
use url::Url;

use crate::notify::{ClientWindow, Clients, NotificationIntent, Notifier};

/// Prints each notification as one line.
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
  async fn show(&self, intent: &NotificationIntent) -> Result<()> {
    println!(
      "[notification:{}] {} - {} ({})",
      intent.tag, intent.title, intent.body, intent.target_url
    );
    Ok(())
  }
}

/// No windows are ever open; opened ones are remembered for reporting.
#[derive(Default)]
pub struct HeadlessClients {
  opened: Mutex<Vec<Url>>,
}

impl HeadlessClients {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn opened(&self) -> Result<Vec<Url>> {
    let opened = self
      .opened
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(opened.clone())
  }
}

#[async_trait]
impl Clients for HeadlessClients {
  async fn windows(&self) -> Result<Vec<ClientWindow>> {
    Ok(Vec::new())
  }

  async fn focus(&self, id: &str) -> Result<()> {
    Err(eyre!("No client window {}", id))
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    info!(%url, "open window requested");
    self
      .opened
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(url.clone());
    Ok(())
  }

  async fn claim(&self) -> Result<usize> {
    Ok(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_headless_clients_record_opened_windows() {
    let clients = HeadlessClients::new();
    assert!(clients.windows().await.unwrap().is_empty());
    assert_eq!(clients.claim().await.unwrap(), 0);

    let url = Url::parse("https://shop.example.com/deals").unwrap();
    clients.open_window(&url).await.unwrap();
    assert_eq!(clients.opened().unwrap(), vec![url]);
    assert!(clients.focus("w1").await.is_err());
  }
}
