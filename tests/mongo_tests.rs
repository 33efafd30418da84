//! Tests against a live MongoDB server configured through `MONGO_*`
//! variables. Run with `cargo test -- --ignored`.

use dbkit::adapters::mongo::MongoDb;
use dbkit::record;
use dbkit::record::Value;
use dbkit::upsert::OnConflict;
use mongodb::bson::doc;
use rstest::rstest;
use uuid::Uuid;

async fn scratch_collection(db: &MongoDb) -> String {
    let collection = format!("dbkit_test_{}", Uuid::new_v4().simple());
    db.create_index(&collection, &["code"], true)
        .await
        .expect("Failed to create index");
    collection
}

#[rstest]
#[tokio::test]
#[ignore = "requires a MongoDB server"]
async fn test_add_batch_updates_collisions() {
    let db = MongoDb::from_env().await.expect("Failed to connect");
    let collection = scratch_collection(&db).await;
    db.add(&collection, &record! { "code" => "x", "n" => 1 }, &OnConflict::Fail)
        .await
        .unwrap();

    let outcome = db
        .add_batch(
            &collection,
            &[
                record! { "code" => "x", "n" => 2 },
                record! { "code" => "y", "n" => 3 },
            ],
            &OnConflict::update(["n"]),
            &["code"],
        )
        .await
        .unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.updated, 1);
    let found = db
        .find(&collection, doc! { "code": "x" }, Some(1))
        .await
        .unwrap();
    assert_eq!(found[0]["n"], Value::Int(2));

    db.drop_collection(&collection).await.unwrap();
}

#[rstest]
#[tokio::test]
#[ignore = "requires a MongoDB server"]
async fn test_add_derives_condition_from_duplicate_error() {
    let db = MongoDb::from_env().await.expect("Failed to connect");
    let collection = scratch_collection(&db).await;
    db.add(&collection, &record! { "code" => "x", "n" => 1 }, &OnConflict::Fail)
        .await
        .unwrap();

    let count = db
        .add(&collection, &record! { "code" => "x", "n" => 5 }, &OnConflict::Replace)
        .await
        .unwrap();

    assert_eq!(count, 0);
    assert_eq!(db.count(&collection, doc! {}, None).await.unwrap(), 1);
    let index_names = db.index_names(&collection).await.unwrap();
    assert!(index_names.iter().any(|name| name.contains("code")));

    db.drop_collection(&collection).await.unwrap();
}
