use common::bootstrap::{url_file_name, FileFetcher, Fetcher};
use reqwest::Client;
use std::io;
use tokio::runtime::Handle;

/// `http(s)://` con reqwest; cualquier otra cosa va a `FileFetcher`.
///
/// Los handlers son síncronos y corren en hilos de `spawn_blocking`, así
/// que la descarga se hace con `block_on` sobre el runtime del host.
pub struct HttpFetcher {
    client: Client,
    runtime: Handle,
    files: FileFetcher,
}

impl HttpFetcher {
    pub fn new(client: Client, runtime: Handle) -> Self {
        Self {
            client,
            runtime,
            files: FileFetcher,
        }
    }
}

fn other(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return self.files.fetch(url);
        }

        let name = url_file_name(url)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("{url} no nombra un archivo"))
            })?
            .to_string();

        let body = self.runtime.block_on(async {
            let resp = self.client.get(url).send().await.map_err(other)?;
            let resp = resp.error_for_status().map_err(other)?;
            resp.bytes().await.map_err(other)
        })?;

        Ok(vec![(name, body.to_vec())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test(flavor = "multi_thread")]
    async fn rutas_locales_van_al_file_fetcher() {
        let dir = std::env::temp_dir().join(format!("handler-host-fetch-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("inventory.csv"), b"sku,qty\n1,2\n").unwrap();
        let url = format!("file://{}", dir.join("inventory.csv").display());

        let fetcher = HttpFetcher::new(Client::new(), Handle::current());
        let files = tokio::task::spawn_blocking(move || fetcher.fetch(&url))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(files, vec![("inventory.csv".to_string(), b"sku,qty\n1,2\n".to_vec())]);
    }
}
