//! End-to-end exercise of the query pipeline: submission, bulk packing, the
//! state driver and the fused timer-poll against a scripted backend whose
//! "server" is the other end of a pipe.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::Interest;

use medley_core::db::backend::{
    ConnEvent, ConnState, ConnectionBackend, StepDirective, StepQueues,
};
use medley_core::db::pool::{BackendFactory, DbCredentials, PoolConfig, PoolRegistry};
use medley_core::db::query::{QueryCallbacks, QueryConfig, query_start};
use medley_core::db::{DbError, QueryResult};

/// Backend scripted against a pipe: the handshake and every bulk send wait
/// for one readable wake from the far end before resolving.
#[derive(Debug)]
struct PipedBackend {
    state: ConnState,
    rd_fd: RawFd,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ConnectionBackend for PipedBackend {
    fn conn_init(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn conn_deinit(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn can_change_state(&self) -> bool {
        true
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_ms(&self) -> u64 {
        3000
    }

    fn sock_fd(&self) -> RawFd {
        self.rd_fd
    }

    fn step(&mut self, queues: &dyn StepQueues, event: ConnEvent) -> Result<StepDirective, DbError> {
        if event == ConnEvent::Close {
            self.state = ConnState::Closed;
            return Ok(StepDirective::Closed);
        }
        if event == ConnEvent::Timeout {
            return Err(DbError::Os);
        }
        let directive = match self.state {
            ConnState::Initialized => {
                self.state = ConnState::Connecting;
                StepDirective::WaitIo(Interest::READABLE)
            }
            ConnState::Connecting => {
                // greeting arrived
                drain(self.rd_fd);
                self.state = ConnState::Idle;
                StepDirective::Yield
            }
            ConnState::Idle => {
                let packed = queues.packed_statements();
                if packed.is_empty() {
                    StepDirective::Yield
                } else {
                    self.sent.lock().unwrap().push(packed);
                    self.state = ConnState::Querying;
                    StepDirective::WaitIo(Interest::READABLE)
                }
            }
            ConnState::Querying => {
                // the reply for the whole batch arrived: one result set per
                // expected set of each processing query, in order
                drain(self.rd_fd);
                while let Some(query) = queues.current_query() {
                    if query.num_result_sets_remaining() == 0 {
                        queues.evict_current_processing_query()?;
                        continue;
                    }
                    while query.num_result_sets_remaining() > 0 {
                        query.dispatch_result(QueryResult {
                            is_final: query.num_result_sets_remaining() == 1,
                            columns: vec!["id".into()],
                            rows: vec![vec![Some("1".into())]],
                            error: None,
                        });
                        queues.evict_current_processing_query()?;
                    }
                }
                self.state = ConnState::Idle;
                StepDirective::Yield
            }
            ConnState::Closed => StepDirective::Closed,
            _ => StepDirective::Yield,
        };
        Ok(directive)
    }
}

fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
    (fds[0], fds[1])
}

fn poke(fd: RawFd) {
    let n = unsafe { libc::write(fd, b"k".as_ptr().cast(), 1) };
    assert_eq!(n, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_roundtrip_over_piped_backend() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
    let (rd, wr) = pipe_pair();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sent_for_factory = Arc::clone(&sent);
    let factory: Box<BackendFactory> = Box::new(move |_cfg| {
        Box::new(PipedBackend {
            state: ConnState::Initialized,
            rd_fd: rd,
            sent: Arc::clone(&sent_for_factory),
        })
    });

    let registry = PoolRegistry::new();
    let pool = registry
        .pool_init(
            PoolConfig {
                alias: "tbl_media".into(),
                capacity: 1,
                bulk_query_limit_kb: 1,
                credentials: DbCredentials {
                    db_name: "media".into(),
                    db_user: "svc".into(),
                    db_passwd: "secret".into(),
                    db_host: "127.0.0.1".into(),
                    db_port: 3306,
                },
                ..Default::default()
            },
            &factory,
        )
        .unwrap();

    // the far end greets, then answers the bulk send
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        poke(wr); // handshake greeting
        tokio::time::sleep(Duration::from_millis(30)).await;
        poke(wr); // batch reply
        wr
    });

    let ready_sets = Arc::new(AtomicUsize::new(0));
    let rows = Arc::new(AtomicUsize::new(0));
    let (rs2, rows2) = (Arc::clone(&ready_sets), Arc::clone(&rows));
    let query = query_start(
        &pool,
        QueryConfig {
            statement: b"SELECT id FROM upload_req;".to_vec(),
            num_result_sets: 2,
            user_data: vec![],
            callbacks: QueryCallbacks {
                result_ready: Box::new(move |_, _| {
                    rs2.fetch_add(1, Ordering::SeqCst);
                }),
                row_fetched: Box::new(move |_, _| {
                    rows2.fetch_add(1, Ordering::SeqCst);
                }),
                ..Default::default()
            },
        },
    )
    .await
    .unwrap();

    assert_eq!(ready_sets.load(Ordering::SeqCst), 2);
    assert_eq!(rows.load(Ordering::SeqCst), 2);
    assert_eq!(query.num_result_sets_remaining(), 0);

    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].as_slice(), b"SELECT id FROM upload_req;");

    let wr = server.await?;
    pool.signal_closing();
    pool.close_all_conns().await;
    assert!(pool.check_all_conns_closed());
    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
    Ok(())
}
