use {
    courier::{AsyncConsumer, ConsumerOpts, HttpUploader, HttpUploaderOpts, RetryOpts},
    parking_lot::Mutex,
    serde_json::{json, Value},
    std::{sync::Arc, time::Duration},
    wiremock::{
        matchers::{method, path},
        Mock,
        MockServer,
        ResponseTemplate,
    },
};

fn uploader_opts() -> HttpUploaderOpts {
    HttpUploaderOpts {
        api_key: Some("test-key".to_owned()),
        request_timeout: Duration::from_secs(5),
        retry: RetryOpts {
            max_retries: 2,
            delay_initial: Duration::from_millis(1),
            delay_maximum: Duration::from_millis(2),
        },
    }
}

fn consumer_opts() -> ConsumerOpts {
    ConsumerOpts {
        queue_capacity: 100,
        flush_queue_size: 10,
        flush_interval: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn delivers_batches_per_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/identify"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let uploader = HttpUploader::new(format!("{}/events", server.uri()), uploader_opts())
        .unwrap()
        .route("identification", format!("{}/identify", server.uri()));
    let consumer = AsyncConsumer::<Value>::new(consumer_opts(), uploader).unwrap();
    consumer.start().unwrap();

    consumer
        .enqueue("events", json!({ "event_type": "signed_up" }))
        .unwrap();
    consumer
        .enqueue("events", json!({ "event_type": "viewed_page" }))
        .unwrap();
    consumer
        .enqueue("identification", json!({ "user_id": "user-1" }))
        .unwrap();
    consumer.flush().await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let events: Value = requests[0].body_json().unwrap();
    assert_eq!(
        events,
        json!({
            "objects": [
                { "event_type": "signed_up" },
                { "event_type": "viewed_page" },
            ]
        })
    );
    assert_eq!(
        requests[0].headers.get("authorization").unwrap(),
        "Bearer test-key"
    );

    let identification: Value = requests[1].body_json().unwrap();
    assert_eq!(
        identification,
        json!({ "objects": [{ "user_id": "user-1" }] })
    );

    consumer.shutdown().await;
}

#[tokio::test]
async fn failed_delivery_reaches_the_error_handler() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let uploader = HttpUploader::new(server.uri(), uploader_opts()).unwrap();
    let consumer = {
        let errors = errors.clone();
        AsyncConsumer::<Value>::with_error_handler(consumer_opts(), uploader, move |error| {
            errors.lock().push(error.to_owned())
        })
        .unwrap()
    };
    consumer.start().unwrap();

    consumer.enqueue("events", json!({ "n": 1 })).unwrap();
    consumer.flush().await;

    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("maximum attempts exceeded"));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    consumer.shutdown().await;
}
