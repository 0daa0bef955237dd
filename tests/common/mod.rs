#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_graphql::{EmptySubscription, ObjectType, Schema};
use graphql_federation_gateway::{
    GraphQLRequest, GraphQLResponse, QueryExecutor, RequestContext, Result,
};

/// Serves a subgraph from an async-graphql schema and records every request.
pub struct InProcess<Q, M> {
    schema: Schema<Q, M, EmptySubscription>,
    requests: Mutex<Vec<GraphQLRequest>>,
}

impl<Q, M> InProcess<Q, M>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
{
    pub fn new(query: Q, mutation: M) -> Arc<Self> {
        let schema = Schema::build(query, mutation, EmptySubscription)
            .enable_federation()
            .finish();
        Arc::new(Self {
            schema,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GraphQLRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl<Q, M> QueryExecutor for InProcess<Q, M>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
{
    async fn execute(&self, request: GraphQLRequest, _ctx: &RequestContext) -> Result<GraphQLResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let variables = serde_json::Value::Object(request.variables.into_iter().collect());
        let request = async_graphql::Request::new(request.query)
            .variables(async_graphql::Variables::from_json(variables));
        let response = self.schema.execute(request).await;
        Ok(serde_json::from_value(serde_json::to_value(&response)?)?)
    }
}

/// Answers every request with the same response.
pub struct Canned {
    response: serde_json::Value,
    requests: Mutex<Vec<GraphQLRequest>>,
}

impl Canned {
    pub fn new(response: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            response,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GraphQLRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl QueryExecutor for Canned {
    async fn execute(&self, request: GraphQLRequest, _ctx: &RequestContext) -> Result<GraphQLResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(serde_json::from_value(self.response.clone())?)
    }
}

pub mod products {
    use async_graphql::{EmptyMutation, Object, SimpleObject, ID};

    pub const SDL: &str = r#"
        type Query {
            product(id: ID!): Product
            topProducts(first: Int = 5): [Product!]!
        }

        type Product @key(fields: "id") {
            id: ID!
            name: String!
            weight: Int
        }
    "#;

    #[derive(SimpleObject, Clone)]
    pub struct Product {
        pub id: ID,
        pub name: String,
        pub weight: Option<i32>,
    }

    fn catalog() -> Vec<Product> {
        [("p1", "Widget", 2), ("p2", "Gadget", 5), ("p3", "Gizmo", 1)]
            .into_iter()
            .map(|(id, name, weight)| Product {
                id: ID::from(id),
                name: name.to_string(),
                weight: Some(weight),
            })
            .collect()
    }

    pub struct Query;

    #[Object]
    impl Query {
        async fn product(&self, id: ID) -> Option<Product> {
            catalog().into_iter().find(|product| product.id == id)
        }

        async fn top_products(&self, #[graphql(default = 5)] first: usize) -> Vec<Product> {
            catalog().into_iter().take(first).collect()
        }

        #[graphql(entity)]
        async fn find_product_by_id(&self, id: ID) -> Option<Product> {
            catalog().into_iter().find(|product| product.id == id)
        }
    }

    pub fn service() -> std::sync::Arc<super::InProcess<Query, EmptyMutation>> {
        super::InProcess::new(Query, EmptyMutation)
    }
}

pub mod inventory {
    use async_graphql::{EmptyMutation, Object, SimpleObject, ID};

    pub const SDL: &str = r#"
        type Query {
            warehouses: [String!]!
        }

        extend type Product @key(fields: "id") {
            id: ID! @external
            price: Float!
            inStock: Boolean
        }
    "#;

    #[derive(SimpleObject)]
    #[graphql(name = "Product")]
    pub struct StockedProduct {
        pub id: ID,
        pub price: f64,
        pub in_stock: Option<bool>,
    }

    pub struct Query;

    #[Object]
    impl Query {
        async fn warehouses(&self) -> Vec<String> {
            vec!["north".into(), "south".into()]
        }

        #[graphql(entity)]
        async fn find_product_by_id(&self, id: ID) -> StockedProduct {
            let price = match id.as_str() {
                "p1" => 9.99,
                "p2" => 24.5,
                _ => 3.0,
            };
            StockedProduct {
                in_stock: Some(id.as_str() != "p3"),
                id,
                price,
            }
        }
    }

    pub fn service() -> std::sync::Arc<super::InProcess<Query, EmptyMutation>> {
        super::InProcess::new(Query, EmptyMutation)
    }
}
