//! End-to-end query and mutation behavior over an in-memory database.

use keel_db::{Database, ExecResult};
use serde_json::Value as Json;

const USER_SDL: &str = "type user {
    name: String
    age: Int
    verified: Boolean
    points: Float
}";

const BOOKS_SDL: &str = "type book {
    name: String
    rating: Float
    author: author
}

type author {
    name: String
    age: Int
    verified: Boolean
    published: [book]
}";

fn db_with(sdl: &str) -> Database {
    let db = Database::new_in_memory().unwrap();
    db.add_schema(sdl).unwrap();
    db
}

fn exec(db: &Database, query: &str) -> ExecResult {
    let result = db.execute_request(query, None, None).unwrap();
    assert!(
        result.errors.is_empty(),
        "unexpected execution errors: {:?}",
        result.errors
    );
    result
}

fn rows(result: &ExecResult) -> Vec<Json> {
    result.data.as_array().cloned().unwrap_or_default()
}

/// Run a create mutation and return the new document key.
fn create(db: &Database, collection: &str, data_json: &str) -> String {
    let escaped = data_json.replace('"', "\\\"");
    let query = format!("mutation {{ create_{collection}(data: \"{escaped}\") {{ _key }} }}");
    let result = exec(db, &query);
    rows(&result)[0]["_key"].as_str().unwrap().to_string()
}

#[test]
fn create_returns_content_derived_key() {
    let db = db_with(USER_SDL);
    let key = create(
        &db,
        "user",
        r#"{"age": 31, "verified": true, "points": 90, "name": "Bob"}"#,
    );
    assert!(key.starts_with("bae-"));
    assert_eq!(key.len(), 40);
    assert!(key[4..]
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == '-'));

    // Identical content derives the identical key, so the second create is
    // rejected as a duplicate (reported as an execution error).
    let escaped = r#"{"age": 31, "verified": true, "points": 90, "name": "Bob"}"#
        .replace('"', "\\\"");
    let result = db
        .execute_request(
            &format!("mutation {{ create_user(data: \"{escaped}\") {{ _key }} }}"),
            None,
            None,
        )
        .unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains(&key));
}

#[test]
fn create_with_unknown_field_reports_execution_error() {
    let db = db_with(USER_SDL);
    let result = db
        .execute_request(
            r#"mutation { create_user(data: "{\"age\": 31, \"notAField\": true}") { _key } }"#,
            None,
            None,
        )
        .unwrap();
    assert_eq!(
        result.errors,
        vec!["The given field does not exist. Name: notAField".to_string()]
    );
}

#[test]
fn filter_le_float_includes_equal_and_int_bounds() {
    let db = db_with(USER_SDL);
    create(&db, "user", r#"{"name": "John", "points": 2.1}"#);
    create(&db, "user", r#"{"name": "Bob", "points": 1.82}"#);

    for filter in ["{points: {_le: 1.82}}", "{points: {_le: 2}}"] {
        let result = exec(
            &db,
            &format!("query {{ user(filter: {filter}) {{ name }} }}"),
        );
        let names: Vec<_> = rows(&result)
            .iter()
            .map(|row| row["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Bob"], "filter {filter}");
    }
}

#[test]
fn filter_le_null_matches_only_missing_values() {
    let db = db_with(USER_SDL);
    create(&db, "user", r#"{"name": "John", "points": 2.1}"#);
    create(&db, "user", r#"{"name": "Bob"}"#);

    let result = exec(&db, "query { user(filter: {points: {_le: null}}) { name } }");
    let names: Vec<_> = rows(&result)
        .iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Bob"]);
}

#[test]
fn dockey_argument_pins_the_scan() {
    let db = db_with(USER_SDL);
    let john = create(&db, "user", r#"{"name": "John", "age": 21}"#);
    create(&db, "user", r#"{"name": "Bob", "age": 32}"#);

    let result = exec(
        &db,
        &format!("query {{ user(dockey: \"{john}\") {{ _key name }} }}"),
    );
    let got = rows(&result);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["_key"], Json::String(john));
    assert_eq!(got[0]["name"], Json::String("John".into()));
}

#[test]
fn order_limit_and_offset() {
    let db = db_with(USER_SDL);
    create(&db, "user", r#"{"name": "John", "age": 21}"#);
    create(&db, "user", r#"{"name": "Bob", "age": 32}"#);
    create(&db, "user", r#"{"name": "Fred", "age": 28}"#);

    let result = exec(&db, "query { user(order: {age: DESC}) { name } }");
    let names: Vec<_> = rows(&result)
        .iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Bob", "Fred", "John"]);

    let result = exec(
        &db,
        "query { user(order: {age: ASC}, limit: 1, offset: 1) { name } }",
    );
    let names: Vec<_> = rows(&result)
        .iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Fred"]);
}

#[test]
fn group_by_with_dockeys_allow_list() {
    let db = db_with(USER_SDL);
    let john = create(&db, "user", r#"{"name": "John", "age": 21}"#);
    create(&db, "user", r#"{"name": "Bob", "age": 32}"#);
    let fred = create(&db, "user", r#"{"name": "Fred", "age": 21}"#);
    create(&db, "user", r#"{"name": "Shahzad", "age": 21}"#);

    let result = exec(
        &db,
        &format!(
            "query {{ user(groupBy: [age]) {{ age _group(dockeys: [\"{john}\", \"{fred}\"]) {{ name }} }} }}"
        ),
    );
    let buckets = rows(&result);
    assert_eq!(buckets.len(), 2);

    let bucket = |age: i64| -> &Json {
        buckets
            .iter()
            .find(|row| row["age"] == Json::from(age))
            .unwrap_or_else(|| panic!("missing bucket for age {age}"))
    };

    // Only allow-listed members appear in _group.
    let mut members: Vec<_> = bucket(21)["_group"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect();
    members.sort();
    assert_eq!(members, vec!["Fred", "John"]);

    // A bucket with an empty intersection still surfaces, with an empty
    // member list.
    assert_eq!(bucket(32)["_group"], Json::Array(vec![]));
}

fn seed_library(db: &Database) -> (String, String) {
    let john = create(
        db,
        "author",
        r#"{"name": "John Grisham", "age": 65, "verified": true}"#,
    );
    let cornelia = create(
        db,
        "author",
        r#"{"name": "Cornelia Funke", "age": 62, "verified": false}"#,
    );
    for (name, rating, author) in [
        ("Painted House", 4.9, &john),
        ("A Time for Mercy", 4.5, &john),
        ("Theif Lord", 4.8, &cornelia),
    ] {
        create(
            db,
            "book",
            &format!(r#"{{"name": "{name}", "rating": {rating}, "author_id": "{author}"}}"#),
        );
    }
    (john, cornelia)
}

#[test]
fn one_to_many_count_is_unaffected_by_rendered_limit() {
    let db = db_with(BOOKS_SDL);
    seed_library(&db);

    let result = exec(
        &db,
        "query { author { name _count(published: {}) published(limit: 1) { name } } }",
    );
    let authors = rows(&result);
    assert_eq!(authors.len(), 2);

    let author = |name: &str| -> &Json {
        authors
            .iter()
            .find(|row| row["name"] == Json::String(name.into()))
            .unwrap_or_else(|| panic!("missing author {name}"))
    };

    let john = author("John Grisham");
    assert_eq!(john["_count"], Json::from(2));
    assert_eq!(john["published"].as_array().unwrap().len(), 1);

    let cornelia = author("Cornelia Funke");
    assert_eq!(cornelia["_count"], Json::from(1));
    assert_eq!(cornelia["published"].as_array().unwrap().len(), 1);
}

#[test]
fn count_with_inner_limit_and_filter() {
    let db = db_with(BOOKS_SDL);
    seed_library(&db);

    let result = exec(
        &db,
        "query { author { name _count(published: {limit: 1}) } }",
    );
    for row in rows(&result) {
        assert_eq!(row["_count"], Json::from(1), "author {}", row["name"]);
    }

    let result = exec(
        &db,
        "query { author { name _count(published: {filter: {rating: {_gt: 4.6}}}) } }",
    );
    let authors = rows(&result);
    let john = authors
        .iter()
        .find(|row| row["name"] == Json::String("John Grisham".into()))
        .unwrap();
    assert_eq!(john["_count"], Json::from(1));
}

#[test]
fn sum_and_average_over_relation_arrays() {
    let db = db_with(BOOKS_SDL);
    seed_library(&db);

    let result = exec(
        &db,
        "query { author { name _sum(published: {field: rating}) _avg(published: {field: rating}) } }",
    );
    let authors = rows(&result);
    let john = authors
        .iter()
        .find(|row| row["name"] == Json::String("John Grisham".into()))
        .unwrap();
    let sum = john["_sum"].as_f64().unwrap();
    assert!((sum - 9.4).abs() < 1e-9);
    let avg = john["_avg"].as_f64().unwrap();
    assert!((avg - 4.7).abs() < 1e-9);

    // Empty sequences aggregate to zero.
    let lonely = create(&db, "author", r#"{"name": "Nobody", "age": 1}"#);
    let result = exec(
        &db,
        &format!(
            "query {{ author(dockey: \"{lonely}\") {{ _count(published: {{}}) _sum(published: {{field: rating}}) _avg(published: {{field: rating}}) }} }}"
        ),
    );
    let row = &rows(&result)[0];
    assert_eq!(row["_count"], Json::from(0));
    assert_eq!(row["_sum"], Json::from(0));
    assert_eq!(row["_avg"], Json::from(0.0));
}

const SCALAR_ARRAYS_SDL: &str = "type user {
    name: String
    favouriteNumbers: [Int]
    nicknames: [String]
}";

#[test]
fn count_over_scalar_arrays_with_filter_and_limit() {
    let db = db_with(SCALAR_ARRAYS_SDL);
    create(
        &db,
        "user",
        r#"{"name": "Shahzad", "favouriteNumbers": [1, 2, 3, 4, 5], "nicknames": ["pal", "buddy"]}"#,
    );

    let result = exec(
        &db,
        "query { user { name favouriteNumbers _count(favouriteNumbers: {}) } }",
    );
    let row = &rows(&result)[0];
    assert_eq!(row["favouriteNumbers"], serde_json::json!([1, 2, 3, 4, 5]));
    assert_eq!(row["_count"], Json::from(5));

    // Element filter runs over the primitives.
    let result = exec(
        &db,
        "query { user { _count(favouriteNumbers: {filter: {_gt: 2}}) } }",
    );
    assert_eq!(rows(&result)[0]["_count"], Json::from(3));

    // Limit applies after the filter.
    let result = exec(
        &db,
        "query { user { _count(favouriteNumbers: {filter: {_gt: 2}, limit: 2}) } }",
    );
    assert_eq!(rows(&result)[0]["_count"], Json::from(2));

    let result = exec(
        &db,
        "query { user { _count(nicknames: {filter: {_like: \"b%\"}}) } }",
    );
    assert_eq!(rows(&result)[0]["_count"], Json::from(1));

    // Counting a non-array field is zero.
    let result = exec(&db, "query { user { _count(name: {}) } }");
    assert_eq!(rows(&result)[0]["_count"], Json::from(0));
}

#[test]
fn sum_and_average_over_scalar_arrays() {
    let db = db_with(SCALAR_ARRAYS_SDL);
    create(
        &db,
        "user",
        r#"{"name": "Shahzad", "favouriteNumbers": [1, 2, 3, 4, 5]}"#,
    );

    let result = exec(
        &db,
        "query { user { _sum(favouriteNumbers: {}) _avg(favouriteNumbers: {}) } }",
    );
    let row = &rows(&result)[0];
    assert_eq!(row["_sum"], Json::from(15));
    assert_eq!(row["_avg"].as_f64().unwrap(), 3.0);

    let result = exec(
        &db,
        "query { user { _sum(favouriteNumbers: {filter: {_ge: 4}}) } }",
    );
    assert_eq!(rows(&result)[0]["_sum"], Json::from(9));
}

#[test]
fn one_to_many_joins_resolve_from_both_sides() {
    let db = db_with(BOOKS_SDL);
    let (john, _) = seed_library(&db);

    // From the many side: each book looks its author up by foreign key.
    let result = exec(&db, "query { book { name author { name } } }");
    let books = rows(&result);
    assert_eq!(books.len(), 3);
    let painted = books
        .iter()
        .find(|row| row["name"] == Json::String("Painted House".into()))
        .unwrap();
    assert_eq!(painted["author"]["name"], Json::String("John Grisham".into()));

    // From the one side: the author's books arrive as an array.
    let result = exec(
        &db,
        &format!("query {{ author(dockey: \"{john}\") {{ published {{ name }} }} }}"),
    );
    let published = rows(&result)[0]["published"].as_array().unwrap().clone();
    let mut names: Vec<_> = published
        .iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["A Time for Mercy", "Painted House"]);
}

const ONE_TO_ONE_SDL: &str = "type book {
    name: String
    author: author
}

type author {
    name: String
    published: book
}";

#[test]
fn one_to_one_create_and_query_from_either_side() {
    let db = db_with(ONE_TO_ONE_SDL);
    let book = create(&db, "book", r#"{"name": "Painted House"}"#);
    create(
        &db,
        "author",
        &format!(r#"{{"name": "John Grisham", "published_id": "{book}"}}"#),
    );

    let result = exec(&db, "query { author { name published { name } } }");
    let authors = rows(&result);
    assert_eq!(authors.len(), 1);
    assert_eq!(
        authors[0]["published"]["name"],
        Json::String("Painted House".into())
    );

    let result = exec(&db, "query { book { name author { name } } }");
    let books = rows(&result);
    assert_eq!(books.len(), 1);
    assert_eq!(
        books[0]["author"]["name"],
        Json::String("John Grisham".into())
    );
}

#[test]
fn one_to_one_create_with_missing_child_is_permissive_by_default() {
    let db = db_with(ONE_TO_ONE_SDL);

    // References a document that does not exist; the permissive contract
    // stores the dangling key as given.
    let result = db
        .execute_request(
            r#"mutation { create_author(data: "{\"name\": \"John Grisham\", \"published_id\": \"bae-fd541c25-229e-5280-b44b-e5c2af3e374d\"}") { name } }"#,
            None,
            None,
        )
        .unwrap();
    assert!(result.errors.is_empty());
    assert_eq!(
        rows(&result)[0]["name"],
        Json::String("John Grisham".into())
    );

    // The dangling reference resolves to null.
    let result = exec(&db, "query { author { name published { name } } }");
    assert_eq!(rows(&result)[0]["published"], Json::Null);
}

#[test]
fn one_to_one_create_with_missing_child_fails_in_strict_mode() {
    let db = db_with(ONE_TO_ONE_SDL);
    db.set_strict_relations(true);

    let result = db
        .execute_request(
            r#"mutation { create_author(data: "{\"name\": \"John Grisham\", \"published_id\": \"bae-fd541c25-229e-5280-b44b-e5c2af3e374d\"}") { name } }"#,
            None,
            None,
        )
        .unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("related document does not exist"));
}

#[test]
fn all_commits_heights_and_head_convergence() {
    let db = db_with(USER_SDL);
    let key = create(&db, "user", r#"{"name": "John", "age": 21}"#);
    exec(
        &db,
        &format!(r#"mutation {{ update_user(id: "{key}", data: "{{\"age\": 22}}") {{ _key }} }}"#),
    );

    let result = exec(
        &db,
        &format!("query {{ allCommits(dockey: \"{key}\") {{ cid height }} }}"),
    );
    let commits = rows(&result);
    let heights: Vec<_> = commits
        .iter()
        .map(|row| row["height"].as_i64().unwrap())
        .collect();
    assert_eq!(heights, vec![2, 1]);

    // Deterministic across runs.
    let again = exec(
        &db,
        &format!("query {{ allCommits(dockey: \"{key}\") {{ cid height }} }}"),
    );
    assert_eq!(result.data, again.data);

    // One head remains: _version yields exactly one cid, the height-2
    // composite.
    let result = exec(
        &db,
        &format!("query {{ user(dockey: \"{key}\") {{ _version {{ cid height }} }} }}"),
    );
    let versions = rows(&result)[0]["_version"].as_array().unwrap().clone();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["height"], Json::from(2));
}

#[test]
fn all_commits_links_name_the_written_fields() {
    let db = db_with(USER_SDL);
    let key = create(&db, "user", r#"{"name": "John", "age": 21}"#);

    let result = exec(
        &db,
        &format!("query {{ allCommits(dockey: \"{key}\") {{ cid links {{ cid name }} }} }}"),
    );
    let commits = rows(&result);
    assert_eq!(commits.len(), 1);
    let mut link_names: Vec<_> = commits[0]["links"]
        .as_array()
        .unwrap()
        .iter()
        .map(|link| link["name"].as_str().unwrap().to_string())
        .collect();
    link_names.sort();
    assert_eq!(link_names, vec!["age", "name"]);
}

#[test]
fn commits_by_cid_and_block_fetch() {
    let db = db_with(USER_SDL);
    let key = create(
        &db,
        "user",
        r#"{"age": 31, "verified": true, "points": 90, "name": "Bob"}"#,
    );

    let result = exec(
        &db,
        &format!("query {{ user(dockey: \"{key}\") {{ _version {{ cid }} }} }}"),
    );
    let cid_text = rows(&result)[0]["_version"][0]["cid"]
        .as_str()
        .unwrap()
        .to_string();

    // commits(cid:) returns exactly the matching commit.
    let result = exec(
        &db,
        &format!("query {{ commits(cid: \"{cid_text}\") {{ cid height }} }}"),
    );
    let commits = rows(&result);
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0]["cid"], Json::String(cid_text.clone()));

    // An undecodable cid yields an empty result, not an error.
    let result = exec(&db, "query { commits(cid: \"fhbnjfahfhfhanfhga\") { cid height } }");
    assert_eq!(rows(&result).len(), 0);

    // The raw block is the canonical composite-commit encoding.
    let cid: cid::Cid = cid_text.parse().unwrap();
    let bytes = db.get_block(&cid).unwrap();
    let commit = keel_crdt::Commit::decode(&cid, &bytes).unwrap();
    assert!(commit.is_composite());
    assert_eq!(commit.dockey, key);
    assert_eq!(commit.height, 1);
    assert_eq!(commit.links.len(), 4);
}

#[test]
fn update_with_filter_and_delete_tombstone() {
    let db = db_with(USER_SDL);
    create(&db, "user", r#"{"name": "John", "age": 21}"#);
    create(&db, "user", r#"{"name": "Bob", "age": 32}"#);

    let result = exec(
        &db,
        r#"mutation { update_user(filter: {age: {_lt: 30}}, data: "{\"age\": 23}") { name age } }"#,
    );
    let updated = rows(&result);
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["name"], Json::String("John".into()));
    assert_eq!(updated[0]["age"], Json::from(23));

    let result = exec(
        &db,
        r#"mutation { delete_user(filter: {name: {_eq: "Bob"}}) { _key name } }"#,
    );
    let deleted = rows(&result);
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0]["name"], Json::String("Bob".into()));

    // The tombstoned document no longer surfaces in queries.
    let result = exec(&db, "query { user { name } }");
    let names: Vec<_> = rows(&result)
        .iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["John"]);
}

#[test]
fn aliases_rename_rendered_fields() {
    let db = db_with(USER_SDL);
    create(&db, "user", r#"{"name": "John", "age": 21}"#);

    let result = exec(&db, "query { user { FullName: name Years: age } }");
    let row = &rows(&result)[0];
    assert_eq!(row["FullName"], Json::String("John".into()));
    assert_eq!(row["Years"], Json::from(21));
    assert!(row.get("name").is_none());
}

#[test]
fn explain_renders_the_plan_tree() {
    let db = db_with(BOOKS_SDL);
    seed_library(&db);

    let result = exec(&db, "query @explain { book { name author { name } } }");
    let explained = rows(&result);
    assert_eq!(explained.len(), 1);

    let select = &explained[0]["explain"]["selectTopNode"]["selectNode"];
    assert_eq!(select["filter"], Json::Null);

    let join = &select["typeIndexJoin"];
    assert_eq!(join["joinType"], Json::String("typeJoinOne".into()));
    assert_eq!(join["direction"], Json::String("primary".into()));
    assert_eq!(join["rootName"], Json::String("book".into()));
    assert_eq!(join["subTypeName"], Json::String("author".into()));

    let root_scan = &join["root"]["scanNode"];
    assert_eq!(root_scan["collectionName"], Json::String("book".into()));
    assert_eq!(root_scan["collectionID"], Json::String("1".into()));
    let spans = root_scan["spans"].as_array().unwrap();
    assert_eq!(spans[0]["start"], Json::String("/1".into()));
    assert_eq!(spans[0]["end"], Json::String("/2".into()));

    let sub_scan = &join["subType"]["selectTopNode"]["selectNode"]["scanNode"];
    assert_eq!(sub_scan["collectionName"], Json::String("author".into()));
}

#[test]
fn explain_execute_reports_counters() {
    let db = db_with(USER_SDL);
    create(&db, "user", r#"{"name": "John", "age": 21}"#);
    create(&db, "user", r#"{"name": "Bob", "age": 32}"#);

    let result = exec(&db, "query @explain(type: execute) { user { name } }");
    let explained = rows(&result);
    let scan = &explained[0]["explain"]["selectTopNode"]["selectNode"]["scanNode"];
    assert_eq!(scan["docFetches"], Json::from(2));
}

#[tokio::test]
async fn subscriptions_deliver_matching_writes() {
    let db = db_with(USER_SDL);

    let outcome = db
        .handle_request("subscription { user { _key age name } }", None, None)
        .unwrap();
    let mut rx = match outcome {
        keel_db::RequestOutcome::Subscription(rx) => rx,
        _ => panic!("expected a subscription stream"),
    };

    let key = create(
        &db,
        "user",
        r#"{"age": 31, "verified": true, "points": 90, "name": "Bob"}"#,
    );

    let payload = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("subscription delivery within a second")
        .expect("channel open");
    let row = &payload.data.as_array().unwrap()[0];
    assert_eq!(row["_key"], Json::String(key));
    assert_eq!(row["age"], Json::from(31));
    assert_eq!(row["name"], Json::String("Bob".into()));
}
