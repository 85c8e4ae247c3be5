use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;

/// Extension for files that are still being written.
const TEMP_EXT: &str = concat!(env!("CARGO_PKG_NAME"), "_temp");

/// Destination for a downloaded or decrypted file. The pipeline only opens
/// scoped streams against it; dropping a stream releases it.
///
/// Output is staged: [`Self::open_output`] writes to a separate location and
/// nothing appears under the final name until [`Self::commit`].
pub trait DownloadSink: Send + Sync {
    /// Human-readable final location, used in messages that ask the user to
    /// delete the file.
    fn location(&self) -> String;

    /// Human-readable location of the staged output.
    fn staging_location(&self) -> String;

    /// Whether a committed file already exists under the final name.
    fn exists(&self) -> io::Result<bool>;

    /// Open the committed file for reading.
    fn open_input(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Open the staged output for writing from the start, discarding any
    /// previous staged contents.
    fn open_output(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Replace the committed file with the staged output.
    fn commit(&self) -> io::Result<()>;

    /// Length of the committed file.
    fn byte_len(&self) -> io::Result<u64>;
}

/// Platform collaborator that decides where files live.
pub trait StorageProvider: Send + Sync {
    fn sink(&self, file_name: &str) -> io::Result<Arc<dyn DownloadSink>>;
}

/// Flush `output` regardless of how the stage ended. A flush failure only
/// replaces a successful result.
pub(crate) fn finish_output<T, E>(
    result: Result<T, E>,
    output: &mut (impl Write + ?Sized),
    map_err: impl FnOnce(io::Error) -> E,
) -> Result<T, E> {
    let flushed = output.flush();

    match (result, flushed) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(map_err(e)),
        (Err(e), _) => Err(e),
    }
}

/// Append an extension to the path without replacing the existing one.
fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Stores files in a single directory. Server-provided names are reduced to
/// their final path component.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
        }
    }

    pub fn path_for(&self, file_name: &str) -> io::Result<PathBuf> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput,
                format!("Invalid file name: {file_name:?}")))?;

        Ok(self.dir.join(name))
    }
}

impl StorageProvider for FileStorage {
    fn sink(&self, file_name: &str) -> io::Result<Arc<dyn DownloadSink>> {
        let path = self.path_for(file_name)?;
        let temp_path = add_extension(&path, TEMP_EXT);
        debug!("Storage path for {file_name:?}: {path:?} (temp: {temp_path:?})");

        Ok(Arc::new(FileSink { path, temp_path }))
    }
}

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    temp_path: PathBuf,
}

impl FileSink {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl DownloadSink for FileSink {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn staging_location(&self) -> String {
        self.temp_path.display().to_string()
    }

    fn exists(&self) -> io::Result<bool> {
        self.path.try_exists()
    }

    fn open_input(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }

    fn open_output(&self) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)?;

        Ok(Box::new(BufWriter::new(file)))
    }

    fn commit(&self) -> io::Result<()> {
        debug!("Moving {:?} to {:?}", self.temp_path, self.path);
        fs::rename(&self.temp_path, &self.path)
    }

    fn byte_len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }
}
