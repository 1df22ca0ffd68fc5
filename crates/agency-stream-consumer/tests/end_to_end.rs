use agency_stream_consumer::{
    cache::ExistenceCache,
    consumer::{GrpcBatchSource, RunOutcome, RunSettings, StreamConsumer},
    directory::{EntityKind, MemoryDirectory},
};
use agency_stream_server::server::{
    config::ServerConfig,
    service::handler::{ContractStreamService, build_generator_service},
};
use core::time::Duration;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Server};

async fn spawn_generator(wait_time: Duration) -> SocketAddr {
    let config = ServerConfig {
        default_batch_size: 10,
        wait_time,
        max_records_per_request: 10_000,
        stream_buffer_size: 8,
        shutdown_timeout: Duration::from_secs(1),
        server_addr: "127.0.0.1:0".parse().unwrap(),
    };
    let listener = TcpListener::bind(config.server_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        Server::builder()
            .add_service(build_generator_service(ContractStreamService::new(config)))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

fn source(addr: SocketAddr) -> GrpcBatchSource {
    GrpcBatchSource::new(Endpoint::from_shared(format!("http://{addr}")).unwrap())
}

#[tokio::test]
async fn ingests_every_record_when_all_references_exist() {
    let addr = spawn_generator(Duration::ZERO).await;
    // The generator draws counterparties from 1..=10 and real estates from
    // 101..=110.
    let directory = Arc::new(MemoryDirectory::seeded(10, 10));
    let consumer = StreamConsumer::new(
        source(addr),
        Arc::clone(&directory),
        RunSettings {
            count: 25,
            batch_size: 10,
        },
    );

    let outcome = consumer.run(&CancellationToken::new()).await.unwrap();

    assert!(matches!(
        outcome,
        RunOutcome::Completed {
            received: 25,
            created: 25,
            ..
        }
    ));
    assert_eq!(directory.created_count(), 25);
    assert!(consumer.cache().len() <= 20);
}

#[tokio::test]
async fn only_records_with_known_references_are_created() {
    let addr = spawn_generator(Duration::ZERO).await;
    let directory = Arc::new(MemoryDirectory::seeded(5, 5));
    let consumer = StreamConsumer::new(
        source(addr),
        Arc::clone(&directory),
        RunSettings {
            count: 60,
            batch_size: 0,
        },
    )
    .with_cache(ExistenceCache::new(Duration::from_secs(60)));

    let outcome = consumer.run(&CancellationToken::new()).await.unwrap();

    let RunOutcome::Completed {
        received, created, ..
    } = outcome
    else {
        panic!("run did not complete: {outcome:?}");
    };
    assert_eq!(received, 60);
    assert_eq!(created, directory.created_count());
    for (_, record) in directory.created() {
        assert!((1..=5).contains(&record.counterparty_id));
        assert!((101..=105).contains(&record.real_estate_id));
    }
    for id in 6..=10 {
        assert_ne!(consumer.cache().get(EntityKind::Counterparty, id), Some(true));
    }
}

#[tokio::test]
async fn oversized_request_ends_the_run_without_retry() {
    let addr = spawn_generator(Duration::ZERO).await;
    let directory = Arc::new(MemoryDirectory::seeded(10, 10));
    let consumer = StreamConsumer::new(
        source(addr),
        Arc::clone(&directory),
        RunSettings {
            count: 10_001,
            batch_size: 10,
        },
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        consumer.run(&CancellationToken::new()),
    )
    .await
    .expect("run should end instead of retrying")
    .unwrap();

    assert!(matches!(
        outcome,
        RunOutcome::Incomplete {
            received: 0,
            created: 0,
            ..
        }
    ));
    assert_eq!(directory.created_count(), 0);
}

#[tokio::test]
async fn cancellation_stops_a_paced_run() {
    let addr = spawn_generator(Duration::from_secs(3600)).await;
    let directory = Arc::new(MemoryDirectory::seeded(10, 10));
    let consumer = StreamConsumer::new(
        source(addr),
        Arc::clone(&directory),
        RunSettings {
            count: 30,
            batch_size: 10,
        },
    );
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        })
    };

    let outcome = consumer.run(&cancel).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    // Only the first batch arrived before the pause.
    assert_eq!(directory.created_count(), 10);
}

#[tokio::test]
async fn unreachable_generator_is_retried_until_cancelled() {
    // Reserve a port, then free it so nothing listens there.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let consumer = StreamConsumer::new(
        source(addr),
        Arc::new(MemoryDirectory::seeded(10, 10)),
        RunSettings {
            count: 5,
            batch_size: 5,
        },
    )
    .with_backoff(Duration::from_millis(50));
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };

    let result = consumer.run(&cancel).await;
    canceller.await.unwrap();

    assert!(matches!(result, Ok(RunOutcome::Cancelled)));
}
