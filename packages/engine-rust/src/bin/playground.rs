//! Runs queries against a small in-memory library through the full decorator
//! stack and prints the results as JSON.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use quarry_core::condition_tree::plain::from_plain_object;
use quarry_core::schema::{ColumnSchema, PrimitiveType};
use quarry_core::value::{field_value, to_record};
use quarry_core::{
    AggregateOperation, Aggregation, AggregationGroup, Caller, CollectionSchema, ConditionTree, Filter, Operator,
    PaginatedFilter, Projection, Record, Value,
};
use quarry_engine::decorators::{handler, handler_sync, CollectionContext, ComputedDefinition, RelationDefinition};
use quarry_engine::{telemetry, DecoratorStack, EngineConfig, MemoryDatasource};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "quarry-playground")]
#[command(about = "Query an in-memory library through the decorator stack", long_about = None)]
struct Args {
    /// Default tracing filter when `RUST_LOG` is unset.
    #[arg(long, env = "QUARRY_LOG", default_value = "info")]
    log: String,
    /// Emit logs as JSON lines.
    #[arg(long, env = "QUARRY_JSON_LOGS", default_value_t = false)]
    json_logs: bool,
    /// Skip the per-operation tracing spans.
    #[arg(long, default_value_t = false)]
    no_instrument: bool,
    /// Caller id, used by the `--scoped` permission scope.
    #[arg(long, env = "QUARRY_CALLER_ID", default_value_t = 1)]
    caller_id: i64,
    /// Restrict books to those owned by the caller.
    #[arg(long, default_value_t = false)]
    scoped: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List records of a collection.
    List {
        #[arg(long, default_value = "books")]
        collection: String,
        /// Comma-separated field paths, relations as `author:full_name`.
        #[arg(long, default_value = "id,title,byline")]
        fields: String,
        /// Condition tree as JSON, e.g. `{"field":"id","operator":"greater_than","value":1}`.
        #[arg(long)]
        filter: Option<String>,
        /// Free-text search over the collection's columns.
        #[arg(long)]
        search: Option<String>,
        /// Extend the search to to-one relations.
        #[arg(long, default_value_t = false)]
        extended: bool,
        /// Named segment, e.g. `premium`.
        #[arg(long)]
        segment: Option<String>,
    },
    /// Aggregate a collection, optionally grouped by one field.
    Aggregate {
        #[arg(long, default_value = "books")]
        collection: String,
        /// One of count, sum, avg, max, min.
        #[arg(long, default_value = "count")]
        operation: String,
        #[arg(long)]
        field: Option<String>,
        #[arg(long)]
        group_by: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn library() -> MemoryDatasource {
    MemoryDatasource::new()
        .with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("title", ColumnSchema::new(PrimitiveType::String))
                .with_field("price", ColumnSchema::new(PrimitiveType::Number))
                .with_field("author_id", ColumnSchema::new(PrimitiveType::Number))
                .with_field("owner_id", ColumnSchema::new(PrimitiveType::Number)),
            vec![
                to_record(json!({"id": 1, "title": "Foundation", "price": 12, "author_id": 1, "owner_id": 1})),
                to_record(json!({"id": 2, "title": "I, Robot", "price": 9, "author_id": 1, "owner_id": 2})),
                to_record(json!({"id": 3, "title": "Dune", "price": 15, "author_id": 2, "owner_id": 1})),
            ],
        )
        .with_collection(
            "persons",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("first_name", ColumnSchema::new(PrimitiveType::String))
                .with_field("last_name", ColumnSchema::new(PrimitiveType::String)),
            vec![
                to_record(json!({"id": 1, "first_name": "Isaac", "last_name": "Asimov"})),
                to_record(json!({"id": 2, "first_name": "Frank", "last_name": "Herbert"})),
            ],
        )
}

fn joined(paths: &'static [&'static str]) -> ComputedDefinition {
    ComputedDefinition::new(
        PrimitiveType::String,
        paths.iter().copied().collect::<Projection>(),
        handler(move |records: Vec<Record>, _context| async move {
            Ok(records
                .iter()
                .map(|record| {
                    let parts: Vec<String> = paths.iter().map(|path| field_value(record, path).display()).collect();
                    Value::from(parts.join(" "))
                })
                .collect())
        }),
    )
}

fn customize(stack: &DecoratorStack, scoped: bool) -> anyhow::Result<()> {
    stack
        .relation
        .collection("books")?
        .add_relation("author", RelationDefinition::many_to_one("persons", "author_id"))?;
    stack.add_computed_field("persons", "full_name", joined(&["first_name", "last_name"]))?;
    stack.add_computed_field("books", "byline", joined(&["title", "author:full_name"]))?;
    stack.segment.collection("books")?.add_segment(
        "premium",
        handler_sync(|(), _context: &CollectionContext| Ok(ConditionTree::leaf("price", Operator::GreaterThan, 10))),
    );
    if scoped {
        stack
            .scope
            .collection("books")?
            .set_scope(Some(ConditionTree::leaf("owner_id", Operator::Equal, "{{currentUser.id}}")))?;
    }
    Ok(())
}

fn operation(name: &str) -> anyhow::Result<AggregateOperation> {
    Ok(match name {
        "count" => AggregateOperation::Count,
        "sum" => AggregateOperation::Sum,
        "avg" => AggregateOperation::Avg,
        "max" => AggregateOperation::Max,
        "min" => AggregateOperation::Min,
        other => bail!("unknown aggregate operation '{other}'"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(&args.log, args.json_logs);

    let config = EngineConfig { instrument: !args.no_instrument, ..EngineConfig::default() };
    let stack = DecoratorStack::new(Arc::new(library()), config);
    customize(&stack, args.scoped)?;

    let datasource = stack.datasource();
    let caller = Caller::new(args.caller_id, "playground@example.com");
    info!(caller = caller.id, scoped = args.scoped, "playground ready");

    let output = match args.command {
        Command::List { collection, fields, filter, search, extended, segment } => {
            let tree = filter
                .map(|raw| -> anyhow::Result<ConditionTree> {
                    let json: serde_json::Value = serde_json::from_str(&raw).context("filter is not valid JSON")?;
                    Ok(from_plain_object(&json)?)
                })
                .transpose()?;
            let mut base = Filter::new().with_condition_tree(tree);
            if let Some(search) = search {
                base = base.with_search(search, extended);
            }
            if let Some(segment) = segment {
                base = base.with_segment(segment);
            }
            let filter = PaginatedFilter::from_base_filter(base);
            let records = datasource
                .get_collection(&collection)?
                .list(&caller, filter, Projection::from(fields.as_str()))
                .await?;
            serde_json::Value::Array(records.into_iter().map(|record| Value::Record(record).to_json()).collect())
        }
        Command::Aggregate { collection, operation: name, field, group_by, limit } => {
            let mut aggregation = Aggregation::new(operation(&name)?);
            if let Some(field) = field {
                aggregation = aggregation.with_field(field);
            }
            if let Some(group) = group_by {
                aggregation = aggregation.with_group(AggregationGroup::new(group));
            }
            let rows = datasource
                .get_collection(&collection)?
                .aggregate(&caller, Filter::new(), aggregation, limit)
                .await?;
            serde_json::Value::Array(
                rows.into_iter()
                    .map(|row| json!({"value": row.value.to_json(), "group": Value::Record(row.group).to_json()}))
                    .collect(),
            )
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
