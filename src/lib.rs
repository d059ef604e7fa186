//!A schema registry: a centralized service that stores versioned message
//!schemas in Avro, JSON Schema, and Protobuf, assigns them stable numeric
//!identifiers, and enforces a configurable evolution compatibility contract
//!on every registration. The wire protocol is API-compatible with the
//![Confluent Schema Registry](https://github.com/confluentinc/schema-registry).
//!
//!## The library
//!
//!The crate is organized leaves-first:
//!
//!- [`storage`] - the versioned key-value contract the registry consumes,
//!  with an in-memory implementation for test mode and degraded fallback
//!- [`formats`] - per-format engines (validate / serialize / deserialize /
//!  compatibility) for Avro (`apache-avro`), JSON Schema (`jsonschema`), and
//!  Protobuf (`prost-reflect`)
//!- [`wire`] - the 5-byte framed envelope (magic byte + big-endian schema ID)
//!  producers prepend to message bodies
//!- [`registry`] - the versioning state machine, ID allocator, read-through
//!  caches, and the watch-based invalidation loop
//!- [`rest`] - the Confluent-compatible HTTP route table, served with `axum`
//!
//!### Compatibility levels
//!
//!`BACKWARD`, `FORWARD`, `FULL`, `NONE`, and their `_TRANSITIVE` variants.
//!Transitive levels are checked against every prior version of a subject;
//!base levels only against the latest. The default when nothing is
//!configured is `BACKWARD`.
//!
//!## Running
//!
//!```bash
//!schemaregistry --http-addr :8081 --test
//!```
//!
//!Test mode runs against the in-process store; point `--store-url` at a real
//!deployment's versioned KV otherwise.

pub mod error;
pub mod formats;
pub mod model;
pub mod registry;
pub mod rest;
pub mod storage;
pub mod wire;
