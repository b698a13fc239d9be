const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

type Chunk = std::io::Result<Vec<u8>>;

/// `std::io::Write` adapter that hands fixed-size chunks to the response body.
/// Writes fail with `BrokenPipe` once the client has gone away.
pub struct ChannelWriter {
    tx: tokio::sync::mpsc::Sender<Chunk>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: tokio::sync::mpsc::Sender<Chunk>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client disconnected")
        })
    }
}

/// Runs `produce` on the blocking pool and streams whatever it writes. A failure after the
/// response has started aborts the body so the client sees a truncated transfer.
pub fn stream_body<F>(what: String, produce: F) -> axum::body::Body
where
    F: FnOnce(&mut ChannelWriter) -> std::io::Result<()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx.clone());
        let result = produce(&mut writer).and_then(|()| std::io::Write::flush(&mut writer));
        match result {
            Ok(()) => {
                crate::log_debug!("Finished streaming {}", &what);
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                crate::log_info!("Client went away while streaming {}", &what);
            }
            Err(e) => {
                crate::log_with_context!(error, e, "Streaming {} failed", &what);
                let _ = tx.blocking_send(Err(e));
            }
        }
    });

    axum::body::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx))
}

/// Yields exactly `remaining` bytes of `inner`. Running dry early is an `UnexpectedEof`, so a
/// file that shrank after its length went out fails the transfer instead of corrupting it.
pub struct ExactLen<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactLen<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<R: std::io::Read> std::io::Read for ExactLen<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf
            .len()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended with {} bytes still announced", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Copies exactly `len` bytes of an already opened file into `out`, the length announced in
/// the response headers.
pub fn copy_file(file: std::fs::File, len: u64, out: &mut ChannelWriter) -> std::io::Result<()> {
    std::io::copy(&mut ExactLen::new(file, len), out)?;
    Ok(())
}

/// A directory archive request, resolved against the index before streaming starts.
#[derive(Debug, Clone)]
pub struct DirArchive {
    /// Absolute path of the archived directory.
    pub dir_path: std::path::PathBuf,
    /// Top level name inside the archive, the directory's own base name.
    pub top_name: String,
    /// Present files below the directory, relative to it.
    pub members: Vec<String>,
}

impl DirArchive {
    /// `files` are root-relative names from the index, all below `dir_name`.
    pub fn new(
        root: &crate::walker::MovieRoot,
        dir_name: &str,
        files: Vec<String>,
    ) -> Self {
        let (dir_path, top_name, prefix) = if dir_name == crate::store::ROOT_NAME {
            (root.path.clone(), root.archive_name(), String::new())
        } else {
            let top_name = dir_name.rsplit('/').next().unwrap_or(dir_name).to_owned();
            (root.path.join(dir_name), top_name, format!("{dir_name}/"))
        };

        let members = files
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_owned))
            .collect();

        Self {
            dir_path,
            top_name,
            members,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.tar", self.top_name)
    }

    /// Writes a tar of every member, each stored as `top_name/member`. Members that vanished
    /// or became unreadable since indexing are logged and left out.
    pub fn write_to<W: std::io::Write>(&self, out: W) -> std::io::Result<W> {
        let mut builder = tar::Builder::new(out);

        for member in &self.members {
            let path = self.dir_path.join(member);
            let metadata = match std::fs::symlink_metadata(&path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    crate::log_warn!("Archive member {:?} is no longer a regular file", &path);
                    continue;
                }
                Err(e) => {
                    crate::log_with_context!(warn, e, "Skipping archive member {:?}", &path);
                    continue;
                }
            };
            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    crate::log_with_context!(warn, e, "Skipping unreadable archive member {:?}", &path);
                    continue;
                }
            };
            let len = match file.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    crate::log_with_context!(warn, e, "Skipping archive member {:?}", &path);
                    continue;
                }
            };

            let mut header = tar::Header::new_gnu();
            header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);
            header.set_size(len);
            let archived = format!("{}/{}", self.top_name, member);
            crate::log_trace!("Adding {} to archive", &archived);
            builder.append_data(&mut header, &archived, ExactLen::new(file, len))?;
        }

        builder.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, crate::walker::MovieRoot) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("moviedir");
        std::fs::create_dir_all(root.join("show/season 1")).expect("mkdir");
        std::fs::write(root.join("show/season 1/e01.mkv"), vec![7u8; 200_000]).expect("write");
        std::fs::write(root.join("show/notes.txt"), b"notes").expect("write");
        std::fs::write(root.join("top.avi"), [0u8, 159, 146, 150]).expect("write");
        let root = crate::walker::MovieRoot::open("movie", &root).expect("root");
        (dir, root)
    }

    fn read_back(bytes: &[u8]) -> std::collections::BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .expect("entries")
            .map(|entry| {
                let mut entry = entry.expect("entry");
                let path = entry.path().expect("path").to_string_lossy().into_owned();
                let mut content = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut content).expect("read");
                (path, content)
            })
            .collect()
    }

    #[test]
    fn subdirectory_archive_is_rooted_at_its_name() {
        let (_dir, root) = fixture();
        let archive = DirArchive::new(
            &root,
            "show",
            vec!["show/notes.txt".to_owned(), "show/season 1/e01.mkv".to_owned()],
        );
        assert_eq!(archive.file_name(), "show.tar");

        let bytes = archive.write_to(Vec::new()).expect("archive");
        let entries = read_back(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["show/notes.txt"], b"notes");
        assert_eq!(entries["show/season 1/e01.mkv"], vec![7u8; 200_000]);
    }

    #[test]
    fn root_archive_uses_root_directory_name() {
        let (_dir, root) = fixture();
        let archive = DirArchive::new(
            &root,
            crate::store::ROOT_NAME,
            vec!["show/notes.txt".to_owned(), "top.avi".to_owned()],
        );
        let entries = read_back(&archive.write_to(Vec::new()).expect("archive"));
        assert_eq!(
            entries.keys().cloned().collect::<Vec<_>>(),
            vec!["moviedir/show/notes.txt".to_owned(), "moviedir/top.avi".to_owned()]
        );
        assert_eq!(entries["moviedir/top.avi"], [0u8, 159, 146, 150]);
    }

    #[test]
    fn vanished_members_are_skipped() {
        let (_dir, root) = fixture();
        let archive = DirArchive::new(
            &root,
            "show",
            vec!["show/notes.txt".to_owned(), "show/gone.mkv".to_owned()],
        );
        let entries = read_back(&archive.write_to(Vec::new()).expect("archive"));
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("show/notes.txt"));
    }

    #[test]
    fn exact_len_rejects_short_sources() {
        let mut out = Vec::new();
        let err = std::io::Read::read_to_end(&mut ExactLen::new(&b"abc"[..], 5), &mut out)
            .expect_err("short source");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut ExactLen::new(&b"abcdef"[..], 3), &mut out)
            .expect("long source");
        assert_eq!(out, b"abc");
    }

    #[test]
    fn shrunk_member_aborts_the_archive() {
        let (_dir, root) = fixture();
        let path = root.path.join("show/notes.txt");
        let file = std::fs::File::open(&path).expect("open");
        std::fs::write(&path, b"no").expect("truncate");

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        let err = builder
            .append_data(&mut header, "show/notes.txt", ExactLen::new(file, 5))
            .expect_err("short member");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_body_delivers_everything() {
        let payload: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let body = stream_body("payload".to_owned(), move |out| {
            std::io::Write::write_all(out, &payload)
        });

        let collected = http_body_util::BodyExt::collect(body)
            .await
            .expect("body")
            .to_bytes();
        assert_eq!(collected.as_ref(), expected.as_slice());
    }
}
