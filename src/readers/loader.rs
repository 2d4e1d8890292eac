use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use tracing::debug;

/// A byte stream opened by a [`Loader`]. Dropping it releases the resource.
pub type Source = Box<dyn Read + Send>;

/// Abstracts the storage readers pull spreadsheets from.
pub trait Loader: Send + Sync {
    /// Opens `name` for reading. A missing resource is reported as
    /// [`io::ErrorKind::NotFound`].
    fn load(&self, name: &str) -> io::Result<Source>;
}

/// Loads files from a single data directory.
pub struct FsLoader {
    data_dir: PathBuf,
}

impl FsLoader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        FsLoader {
            data_dir: data_dir.into(),
        }
    }
}

impl Loader for FsLoader {
    fn load(&self, name: &str) -> io::Result<Source> {
        let file_name = self.data_dir.join(name);

        // the file must sit directly inside the data directory
        if file_name.parent() != Some(self.data_dir.as_path()) {
            debug!(name, "refusing path outside of data directory");
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not in the data directory", name),
            ));
        }
        let file = File::open(&file_name)?;
        Ok(Box::new(file))
    }
}
