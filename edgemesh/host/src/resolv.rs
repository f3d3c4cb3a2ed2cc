use crate::Result;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;

/// Keeps a `nameserver` line for the DNS responder ahead of every other nameserver in the host's
/// resolver configuration.
///
/// The file is the only record of its state: every pass reads it, edits it and writes it back.
#[derive(Debug)]
pub struct ResolverOverlay {
    path: PathBuf,
    ip: Ipv4Addr,
    lock: Mutex<()>,
}

impl ResolverOverlay {
    pub fn new(path: impl Into<PathBuf>, ip: Ipv4Addr) -> Self {
        Self {
            path: path.into(),
            ip,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensures the responder's nameserver line comes first. Returns whether the file changed.
    pub async fn ensure(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let contents = self.read().await?;
        match overlay_nameserver(&contents, self.ip) {
            Some(updated) => {
                self.write(updated).await?;
                tracing::info!(path = %self.path.display(), ip = %self.ip, "Updated resolver configuration");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes the responder's nameserver line, leaving all other lines untouched.
    pub async fn restore(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let contents = self.read().await?;
        match remove_nameserver(&contents, self.ip) {
            Some(updated) => {
                self.write(updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, contents: String) -> Result<()> {
        let tmp = self.path.with_extension("edgemesh");
        tokio::fs::write(&tmp, &contents).await?;
        if let Err(error) = tokio::fs::rename(&tmp, &self.path).await {
            // Bind-mounted files cannot be replaced; truncate and rewrite them in place.
            tracing::debug!(%error, "Failed to replace resolver configuration");
            let _ = tokio::fs::remove_file(&tmp).await;
            tokio::fs::write(&self.path, contents).await?;
        }
        Ok(())
    }
}

/// Returns the address of a `nameserver` line.
fn nameserver(line: &str) -> Option<&str> {
    let mut words = line.split_whitespace();
    if words.next()? != "nameserver" {
        return None;
    }
    words.next()
}

/// Places a `nameserver <ip>` line before every other nameserver line, returning the updated
/// configuration or `None` if it is already in place.
pub fn overlay_nameserver(contents: &str, ip: Ipv4Addr) -> Option<String> {
    let ip = ip.to_string();
    let mut lines = contents.lines().map(String::from).collect::<Vec<_>>();
    let own = lines.iter().position(|l| nameserver(l) == Some(ip.as_str()));
    let other = lines
        .iter()
        .position(|l| matches!(nameserver(l), Some(addr) if addr != ip));

    match (own, other) {
        (Some(_), None) => return None,
        (Some(own), Some(other)) if own < other => return None,
        (Some(own), Some(other)) => {
            let line = lines.remove(own);
            lines.insert(other, line);
        }
        (None, Some(other)) => lines.insert(other, format!("nameserver {ip}")),
        (None, None) => lines.push(format!("nameserver {ip}")),
    }
    Some(render(lines))
}

/// Removes every `nameserver <ip>` line, returning the updated configuration or `None` if there
/// was none.
pub fn remove_nameserver(contents: &str, ip: Ipv4Addr) -> Option<String> {
    let ip = ip.to_string();
    let lines = contents.lines().collect::<Vec<_>>();
    let kept = lines
        .iter()
        .filter(|l| nameserver(l) != Some(ip.as_str()))
        .map(|l| l.to_string())
        .collect::<Vec<_>>();
    if kept.len() == lines.len() {
        return None;
    }
    Some(render(kept))
}

fn render(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 1);

    #[test]
    fn inserts_before_the_first_nameserver() {
        let conf = "# generated\nsearch default.svc\nnameserver 10.96.0.10\nnameserver 8.8.8.8\noptions ndots:5\n";
        assert_eq!(
            overlay_nameserver(conf, IP).unwrap(),
            "# generated\nsearch default.svc\nnameserver 172.17.0.1\nnameserver 10.96.0.10\nnameserver 8.8.8.8\noptions ndots:5\n"
        );
    }

    #[test]
    fn moves_the_own_line_first() {
        let conf = "nameserver 10.96.0.10\n# keep\nnameserver 172.17.0.1\n";
        assert_eq!(
            overlay_nameserver(conf, IP).unwrap(),
            "nameserver 172.17.0.1\nnameserver 10.96.0.10\n# keep\n"
        );
    }

    #[test]
    fn idempotent_when_first() {
        let conf = "search local\nnameserver 172.17.0.1\nnameserver 10.96.0.10\n";
        assert_eq!(overlay_nameserver(conf, IP), None);
        let once = overlay_nameserver("nameserver 8.8.8.8\n", IP).unwrap();
        assert_eq!(overlay_nameserver(&once, IP), None);
    }

    #[test]
    fn appends_without_nameservers() {
        assert_eq!(overlay_nameserver("", IP).unwrap(), "nameserver 172.17.0.1\n");
        assert_eq!(
            overlay_nameserver("search local\n", IP).unwrap(),
            "search local\nnameserver 172.17.0.1\n"
        );
    }

    #[test]
    fn matches_whole_addresses() {
        // 172.17.0.10 contains the own address as a substring.
        let conf = "nameserver 172.17.0.10\n";
        assert_eq!(
            overlay_nameserver(conf, IP).unwrap(),
            "nameserver 172.17.0.1\nnameserver 172.17.0.10\n"
        );
        assert_eq!(remove_nameserver(conf, IP), None);
    }

    #[test]
    fn removes_only_the_own_line() {
        let conf = "# comment\nnameserver 172.17.0.1\nnameserver 10.96.0.10\noptions ndots:5\n";
        assert_eq!(
            remove_nameserver(conf, IP).unwrap(),
            "# comment\nnameserver 10.96.0.10\noptions ndots:5\n"
        );
        assert_eq!(remove_nameserver("nameserver 10.96.0.10\n", IP), None);
    }

    #[tokio::test]
    async fn overlays_and_restores_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let original = "search local\nnameserver 10.96.0.10\n";
        std::fs::write(&path, original).unwrap();

        let overlay = ResolverOverlay::new(&path, IP);
        assert!(overlay.ensure().await.unwrap());
        assert!(!overlay.ensure().await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "search local\nnameserver 172.17.0.1\nnameserver 10.96.0.10\n"
        );

        assert!(overlay.restore().await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }
}
