use futures::future::BoxFuture;
use std::any::{type_name, Any};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinError};
use tracing::{debug, instrument, warn};

use super::{HtmlTable, Reader, Render, Row, RowStream};
use crate::producers::{ProduceError, Producer};

/// Rows buffered between reader and renderer.
const ROW_BUFFER: usize = 1;
/// Rendered bytes are forwarded to the caller in chunks of this size.
const CHUNK_SIZE: usize = 8 * 1024;
/// Chunks buffered between renderer and caller.
const CHUNK_BUFFER: usize = 4;
/// One outcome from the reader, one from the renderer.
const OUTCOME_SLOTS: usize = 2;

type Outcome = Result<(), ProduceError>;

/// Produces a document out of a spreadsheet [`Reader`].
///
/// Every call runs the reader and the renderer on their own blocking
/// workers. A panic on either side is turned into [`ProduceError::Fault`]
/// and never escapes `produce`.
pub struct Spreadsheet<R, T = HtmlTable> {
    reader: Arc<R>,
    renderer: Arc<T>,
}

impl<R: Reader> Spreadsheet<R> {
    pub fn new(reader: R) -> Self {
        Self::with_renderer(reader, HtmlTable)
    }
}

impl<R: Reader, T: Render> Spreadsheet<R, T> {
    pub fn with_renderer(reader: R, renderer: T) -> Self {
        Spreadsheet {
            reader: Arc::new(reader),
            renderer: Arc::new(renderer),
        }
    }

    /// Reads spreadsheet `name` and writes the rendered document to `out`
    /// as it is produced.
    #[instrument(level = "debug", skip(self, out))]
    pub async fn produce<W>(&self, out: &mut W, name: &str) -> Result<(), ProduceError>
    where
        W: Write + Send + ?Sized,
    {
        let (done_tx, done_rx) = mpsc::channel::<Outcome>(OUTCOME_SLOTS);
        let (confirm_tx, confirm_rx) = oneshot::channel::<io::Result<()>>();
        let (rows_tx, rows_rx) = mpsc::channel::<Row>(ROW_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_BUFFER);

        let reader = Arc::clone(&self.reader);
        let source = name.to_string();
        spawn_unit(
            format!("Reader {} panicked", type_name::<R>()),
            name,
            done_tx.clone(),
            move || {
                reader.read(&source, confirm_tx, rows_tx, stop_rx);
                Ok(())
            },
        );

        let renderer = Arc::clone(&self.renderer);
        let title = name.to_string();
        spawn_unit("Renderer panicked".to_string(), name, done_tx, move || {
            match confirm_rx.blocking_recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(ProduceError::Load(err)),
                Err(_) => return Err(ProduceError::Unconfirmed),
            }
            debug!(source = %title, "source confirmed, rendering");

            let rows = RowStream::new(rows_rx, stop_tx);
            let mut sink = BufWriter::with_capacity(CHUNK_SIZE, ChunkSender(chunk_tx));
            renderer
                .render(&mut sink, &title, rows)
                .map_err(ProduceError::Render)?;
            sink.flush().map_err(ProduceError::Render)
        });

        let mut output_err = None;
        while let Some(chunk) = chunk_rx.recv().await {
            if let Err(err) = out.write_all(&chunk) {
                warn!(source = name, error = %err, "output rejected rendered bytes");
                output_err = Some(err);
                break;
            }
        }
        // unblocks a renderer still writing after the output failed
        drop(chunk_rx);

        let outcome = wait_for_done(done_rx, OUTCOME_SLOTS).await;
        match (outcome, output_err) {
            (outcome, None) => outcome,
            (Ok(()), Some(err)) => Err(ProduceError::Output(err)),
            (Err(err), Some(output)) => Err(err.compose(ProduceError::Output(output))),
        }
    }
}

impl<R: Reader, T: Render> Producer for Spreadsheet<R, T> {
    fn html<'a>(
        &'a self,
        out: &'a mut (dyn Write + Send),
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), ProduceError>> {
        Box::pin(self.produce(out, name))
    }
}

/// Runs `unit` on a blocking worker and reports its outcome on `done`.
/// A panic inside `unit` is reported as a fault labelled with `label`.
fn spawn_unit<F>(label: String, name: &str, done: mpsc::Sender<Outcome>, unit: F)
where
    F: FnOnce() -> Outcome + Send + 'static,
{
    let handle = task::spawn_blocking(unit);
    let name = name.to_string();
    tokio::spawn(async move {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(ProduceError::Fault {
                label,
                name,
                payload: fault_payload(err),
            }),
        };
        let _ = done.send(outcome).await;
    });
}

fn fault_payload(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    panic_message(err.into_panic().as_ref())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Collects `slots` outcomes from `done`. More than one failure yields a
/// composite error in arrival order. A missing confirmation is dropped when
/// the reader side reported its own failure, since it is only a symptom.
async fn wait_for_done(mut done: mpsc::Receiver<Outcome>, slots: usize) -> Outcome {
    let mut failures = Vec::new();
    for _ in 0..slots {
        match done.recv().await {
            Some(Err(err)) => failures.push(err),
            Some(Ok(())) => {}
            None => break,
        }
    }
    if failures.len() > 1 {
        failures.retain(|err| !matches!(err, ProduceError::Unconfirmed));
    }
    match failures.into_iter().reduce(ProduceError::compose) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Forwards every write as one chunk to the producing task.
struct ChunkSender(mpsc::Sender<Vec<u8>>);

impl Write for ChunkSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.blocking_send(buf.to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "rendered output is no longer consumed")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::spreadsheet::{is_stopped, Confirm, RowSender, StopSignal};
    use crate::readers::loader::testing::TestLoader;
    use crate::readers::{DelimitedReader, FsLoader, Loader, MonospaceReader};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    fn init_test_logging() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,sheetstream::producers=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    #[derive(Default)]
    struct TestReader {
        read_name: Mutex<Option<String>>,
        rows: Vec<Row>,
        err: Option<&'static str>,
        panic: Option<&'static str>,
        panic_after_rows: Option<&'static str>,
        finished: Arc<AtomicBool>,
    }

    impl Reader for TestReader {
        fn read(&self, name: &str, confirm: Confirm, rows: RowSender, stop: StopSignal) {
            *self.read_name.lock().unwrap() = Some(name.to_string());
            if let Some(msg) = self.panic {
                panic!("{}", msg);
            }
            let _ = confirm.send(match self.err {
                Some(msg) => Err(io::Error::new(io::ErrorKind::Other, msg)),
                None => Ok(()),
            });
            for row in &self.rows {
                if is_stopped(&stop) || rows.blocking_send(row.clone()).is_err() {
                    break;
                }
            }
            if let Some(msg) = self.panic_after_rows {
                panic!("{}", msg);
            }
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    /// Renders one line per row; optionally stops early or panics.
    #[derive(Default)]
    struct ListRenderer {
        take: Option<usize>,
        panic: Option<&'static str>,
    }

    impl Render for ListRenderer {
        fn render(&self, out: &mut dyn Write, title: &str, rows: RowStream) -> io::Result<()> {
            writeln!(out, "# {}", title)?;
            let limit = self.take.unwrap_or(usize::MAX);
            for row in rows.take(limit) {
                match row.error_message {
                    Some(msg) => writeln!(out, "! {}", msg)?,
                    None => writeln!(out, "{}", row.name)?,
                }
            }
            if let Some(msg) = self.panic {
                panic!("{}", msg);
            }
            Ok(())
        }
    }

    fn named(names: &[&str]) -> Vec<Row> {
        names
            .iter()
            .map(|n| Row {
                name: n.to_string(),
                ..Row::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_read_is_ok() {
        let p = Spreadsheet::new(TestReader::default());
        let mut buf = Vec::new();
        p.produce(&mut buf, "name").await.unwrap();
        assert_eq!(
            p.reader.read_name.lock().unwrap().as_deref(),
            Some("name")
        );
        assert!(String::from_utf8(buf).unwrap().contains("<title>name</title>"));
    }

    #[tokio::test]
    async fn read_error_is_returned_and_nothing_written() {
        let p = Spreadsheet::new(TestReader {
            err: Some("must read, but won't"),
            ..TestReader::default()
        });
        let mut buf = Vec::new();
        let err = p.produce(&mut buf, "name").await.unwrap_err();
        assert_eq!(err.to_string(), "must read, but won't");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn reader_panic_is_reported_once_and_nothing_written() {
        init_test_logging();
        let p = Spreadsheet::new(TestReader {
            panic: Some("something went wrong"),
            ..TestReader::default()
        });
        let mut buf = Vec::new();
        let err = p.produce(&mut buf, "name1").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Reader {} panicked on name1: something went wrong",
                type_name::<TestReader>()
            )
        );
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn rows_arrive_in_order() {
        let p = Spreadsheet::with_renderer(
            TestReader {
                rows: named(&["a", "b", "c", "d"]),
                ..TestReader::default()
            },
            ListRenderer::default(),
        );
        let mut buf = Vec::new();
        p.produce(&mut buf, "list").await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "# list\na\nb\nc\nd\n");
    }

    #[tokio::test]
    async fn early_stop_lets_the_reader_finish() {
        let finished = Arc::new(AtomicBool::new(false));
        let names: Vec<String> = (0..100).map(|i| format!("row{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let p = Spreadsheet::with_renderer(
            TestReader {
                rows: named(&refs),
                finished: Arc::clone(&finished),
                ..TestReader::default()
            },
            ListRenderer {
                take: Some(2),
                ..ListRenderer::default()
            },
        );
        let mut buf = Vec::new();
        p.produce(&mut buf, "big").await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "# big\nrow0\nrow1\n");
        assert!(finished.load(Ordering::SeqCst));
    }

    fn people(rows: usize, line: impl Fn(usize) -> String) -> String {
        (0..rows).map(line).collect()
    }

    #[tokio::test]
    async fn early_stop_closes_the_csv_source() {
        let ld = Arc::new(TestLoader::new(format!(
            "Name,Phone\n{}",
            people(50, |i| format!("row{},{}\n", i, i))
        )));
        let loader: Arc<dyn Loader> = ld.clone();
        let p = Spreadsheet::with_renderer(
            DelimitedReader::new(loader),
            ListRenderer {
                take: Some(1),
                ..ListRenderer::default()
            },
        );
        let mut buf = Vec::new();
        p.produce(&mut buf, "people").await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "# people\nrow0\n");
        assert_eq!(ld.load_name().as_deref(), Some("people.csv"));
        assert!(ld.stream_closed());
    }

    #[tokio::test]
    async fn early_stop_closes_the_mon_source() {
        let ld = Arc::new(TestLoader::new(format!(
            "Name    Phone\n{}",
            people(50, |i| format!("row{:<4} {}\n", i, i))
        )));
        let loader: Arc<dyn Loader> = ld.clone();
        let p = Spreadsheet::with_renderer(
            MonospaceReader::new(loader),
            ListRenderer {
                take: Some(1),
                ..ListRenderer::default()
            },
        );
        let mut buf = Vec::new();
        p.produce(&mut buf, "people").await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "# people\nrow0\n");
        assert_eq!(ld.load_name().as_deref(), Some("people.mon"));
        assert!(ld.stream_closed());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let loader: Arc<dyn Loader> = Arc::new(FsLoader::new(dir.path()));
        let p = Spreadsheet::new(DelimitedReader::new(loader));
        let mut buf = Vec::new();
        let err = p.produce(&mut buf, "absent").await.unwrap_err();
        assert!(err.is_not_found(), "got: {err}");
        assert!(buf.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn csv_file_renders_as_html() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("people.csv"),
            "Name,Birthday\n\"Stewart, Jamie\",01/02/1982\n",
        )?;
        let loader: Arc<dyn Loader> = Arc::new(FsLoader::new(dir.path()));
        let p = Spreadsheet::new(DelimitedReader::new(loader));
        let mut buf = Vec::new();
        p.produce(&mut buf, "people").await?;
        let html = String::from_utf8(buf)?;
        assert!(html.contains("<title>people</title>"));
        assert!(html.contains(r#"<td>Stewart, Jamie</td>"#));
        assert!(html.contains(r#"<td align="right">1982-02-01</td>"#));
        Ok(())
    }

    #[tokio::test]
    async fn renderer_panic_is_reported_and_reader_released() {
        init_test_logging();
        let finished = Arc::new(AtomicBool::new(false));
        let p = Spreadsheet::with_renderer(
            TestReader {
                rows: named(&["a", "b", "c"]),
                finished: Arc::clone(&finished),
                ..TestReader::default()
            },
            ListRenderer {
                take: Some(1),
                panic: Some("it-happens"),
                ..ListRenderer::default()
            },
        );
        let mut buf = Vec::new();
        let err = p.produce(&mut buf, "name1").await.unwrap_err();
        assert_eq!(err.to_string(), "Renderer panicked on name1: it-happens");
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn double_fault_reports_both_panics() {
        init_test_logging();
        let p = Spreadsheet::with_renderer(
            TestReader {
                rows: named(&["a"]),
                panic_after_rows: Some("reader boom"),
                ..TestReader::default()
            },
            ListRenderer {
                panic: Some("renderer boom"),
                ..ListRenderer::default()
            },
        );
        let mut buf = Vec::new();
        let err = p.produce(&mut buf, "both").await.unwrap_err();
        let reader = format!(
            "Reader {} panicked on both: reader boom",
            type_name::<TestReader>()
        );
        let renderer = "Renderer panicked on both: renderer boom";
        let msg = err.to_string();
        assert!(
            msg == format!("{reader}; [add] {renderer}") || msg == format!("{renderer}; [add] {reader}"),
            "got: {msg}"
        );
    }

    #[tokio::test]
    async fn faults_are_composed_in_arrival_order() {
        init_test_logging();
        let (done_tx, done_rx) = mpsc::channel::<Outcome>(OUTCOME_SLOTS);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

        spawn_unit("First panicked".to_string(), "n", done_tx.clone(), || {
            panic!("first")
        });
        spawn_unit("Second panicked".to_string(), "n", done_tx.clone(), move || {
            let _ = gate_rx.recv();
            panic!("second")
        });

        // the second unit may only fail once the first outcome is queued
        while done_tx.capacity() == OUTCOME_SLOTS {
            tokio::task::yield_now().await;
        }
        gate_tx.send(()).unwrap();

        let err = wait_for_done(done_rx, OUTCOME_SLOTS).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "First panicked on n: first; [add] Second panicked on n: second"
        );
    }

    #[tokio::test]
    async fn failing_output_does_not_hang() {
        init_test_logging();
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let p = Spreadsheet::with_renderer(
            TestReader {
                rows: named(&["a", "b"]),
                ..TestReader::default()
            },
            ListRenderer::default(),
        );
        let err = p.produce(&mut Closed, "gone").await.unwrap_err();
        assert!(err.to_string().contains("client went away"), "got: {err}");
    }

    #[tokio::test]
    async fn wait_for_done_without_errors() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(Ok(())).await.unwrap();
        tx.send(Ok(())).await.unwrap();
        assert!(wait_for_done(rx, 2).await.is_ok());
    }

    #[tokio::test]
    async fn wait_for_done_with_errors() {
        let other = |msg: &str| -> Outcome {
            Err(ProduceError::Load(io::Error::new(
                io::ErrorKind::Other,
                msg.to_string(),
            )))
        };
        let cases: Vec<(Vec<Outcome>, &str)> = vec![
            (vec![other("err1"), Ok(())], "err1"),
            (vec![Ok(()), other("err1")], "err1"),
            (
                vec![other("err1"), other("err2"), other("err3")],
                "err1; [add] err2; [add] err3",
            ),
        ];

        for (outcomes, want) in cases {
            let slots = outcomes.len();
            let (tx, rx) = mpsc::channel(slots);
            for outcome in outcomes {
                tx.send(outcome).await.unwrap();
            }
            let err = wait_for_done(rx, slots).await.unwrap_err();
            assert_eq!(err.to_string(), want);
        }
    }

    #[tokio::test]
    async fn unconfirmed_is_reported_alone_but_hidden_behind_a_fault() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(Ok(())).await.unwrap();
        tx.send(Err(ProduceError::Unconfirmed)).await.unwrap();
        assert!(matches!(
            wait_for_done(rx, 2).await,
            Err(ProduceError::Unconfirmed)
        ));

        let (tx, rx) = mpsc::channel(2);
        tx.send(Err(ProduceError::Unconfirmed)).await.unwrap();
        tx.send(Err(ProduceError::Fault {
            label: "Reader x panicked".into(),
            name: "n".into(),
            payload: "p".into(),
        }))
        .await
        .unwrap();
        let err = wait_for_done(rx, 2).await.unwrap_err();
        assert_eq!(err.to_string(), "Reader x panicked on n: p");
    }

    #[test]
    fn panic_message_handles_both_string_kinds() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
