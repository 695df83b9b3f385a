//! OpenAPI 3.1 specification for tileserver-rs's API
//!
//! Hand-written static JSON document, matching the documentation style
//! already shipped with the teacher — only the path table and schemas
//! changed to match the pyramid-builder/server surface.

use serde_json::{json, Value};

/// Generate the OpenAPI specification
pub fn generate_openapi_spec(base_url: &str, version: &str) -> Value {
    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "tileserver-rs API",
            "description": "Raster and vector map-tile pyramid builder and server",
            "version": version,
            "license": {
                "name": "MIT",
                "url": "https://github.com/vinayakkulkarni/tileserver-rs/blob/main/LICENSE"
            }
        },
        "servers": [
            { "url": base_url }
        ],
        "paths": {
            "/api/health": {
                "get": {
                    "summary": "Liveness probe",
                    "operationId": "health",
                    "responses": {
                        "200": {
                            "description": "Server is up",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/HealthStatus" }
                                }
                            }
                        }
                    }
                }
            },
            "/api/tile/{datasource}/{z}/{x}/{y}.{ext}": {
                "get": {
                    "summary": "Fetch one tile",
                    "operationId": "getTile",
                    "parameters": [
                        { "name": "datasource", "in": "path", "required": true, "schema": { "type": "string" } },
                        { "name": "z", "in": "path", "required": true, "schema": { "type": "integer" } },
                        { "name": "x", "in": "path", "required": true, "schema": { "type": "integer" } },
                        { "name": "y", "in": "path", "required": true, "schema": { "type": "integer" } },
                        { "name": "ext", "in": "path", "required": true, "schema": { "type": "string" } }
                    ],
                    "responses": {
                        "200": { "description": "Tile bytes" },
                        "204": { "description": "Empty or out-of-bounds tile" },
                        "400": { "description": "Invalid zoom/coordinates" },
                        "500": { "description": "Internal error" }
                    }
                }
            },
            "/api/pyramid": {
                "post": {
                    "summary": "Launch a pyramid build for a DataSource",
                    "operationId": "launchPyramid",
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/PyramidRequest" }
                            }
                        }
                    },
                    "responses": {
                        "202": {
                            "description": "Build launched or already running",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/PyramidLaunch" }
                                }
                            }
                        },
                        "400": { "description": "Validation failed" },
                        "500": { "description": "Internal error" }
                    }
                }
            },
            "/api/datasources": {
                "get": {
                    "summary": "List registered DataSources",
                    "operationId": "listDataSources",
                    "responses": {
                        "200": { "description": "Catalog" }
                    }
                },
                "post": {
                    "summary": "Create or replace a DataSource",
                    "operationId": "upsertDataSource",
                    "responses": {
                        "200": { "description": "Upserted" },
                        "400": { "description": "Validation failed" }
                    }
                },
                "put": {
                    "summary": "Create or replace a DataSource",
                    "operationId": "upsertDataSourcePut",
                    "responses": {
                        "200": { "description": "Upserted" },
                        "400": { "description": "Validation failed" }
                    }
                },
                "delete": {
                    "summary": "Remove a DataSource by id",
                    "operationId": "deleteDataSource",
                    "responses": {
                        "200": { "description": "Removed" },
                        "500": { "description": "Internal error" }
                    }
                }
            },
            "/api/datasources/{id}": {
                "get": {
                    "summary": "Fetch one DataSource",
                    "operationId": "getDataSource",
                    "parameters": [
                        { "name": "id", "in": "path", "required": true, "schema": { "type": "string" } }
                    ],
                    "responses": {
                        "200": { "description": "DataSource" },
                        "404": { "description": "Not found" }
                    }
                }
            },
            "/api/datasources/load_files": {
                "post": {
                    "summary": "Batch-ingest DataSources from a folder on disk",
                    "operationId": "loadDataSourceFiles",
                    "responses": {
                        "200": {
                            "description": "Ingest report",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/LoadFilesReport" }
                                }
                            }
                        },
                        "500": { "description": "Internal error" }
                    }
                }
            }
        },
        "components": {
            "schemas": {
                "HealthStatus": {
                    "type": "object",
                    "properties": {
                        "worker_pid": { "type": "integer" },
                        "worker_type": { "type": "string" },
                        "worker_status": { "type": "string" }
                    }
                },
                "PyramidRequest": {
                    "type": "object",
                    "required": ["datasource_id"],
                    "properties": {
                        "datasource_id": { "type": "string" }
                    }
                },
                "PyramidLaunch": {
                    "type": "object",
                    "properties": {
                        "pyramid_id": { "type": "string" },
                        "already_running": { "type": "boolean" }
                    }
                },
                "LoadFilesReport": {
                    "type": "object",
                    "properties": {
                        "load_vector_datasources": { "type": "integer" },
                        "load_raster_datasources": { "type": "integer" },
                        "errors": { "type": "array", "items": { "type": "string" } }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_has_expected_shape() {
        let spec = generate_openapi_spec("http://localhost:8080", "1.0.0");
        assert_eq!(spec["openapi"], "3.1.0");
        assert_eq!(spec["info"]["title"], "tileserver-rs API");
        assert_eq!(spec["servers"][0]["url"], "http://localhost:8080");
    }

    #[test]
    fn spec_covers_every_documented_route() {
        let spec = generate_openapi_spec("http://localhost:8080", "1.0.0");
        let paths = spec["paths"].as_object().unwrap();
        for path in [
            "/api/health",
            "/api/tile/{datasource}/{z}/{x}/{y}.{ext}",
            "/api/pyramid",
            "/api/datasources",
            "/api/datasources/{id}",
            "/api/datasources/load_files",
        ] {
            assert!(paths.contains_key(path), "missing path: {path}");
        }
    }
}
