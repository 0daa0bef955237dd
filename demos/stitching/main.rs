use std::sync::Arc;

use anyhow::Result;
use async_graphql::{EmptyMutation, EmptySubscription, Object, ObjectType, Schema, SimpleObject, ID};
use graphql_federation_gateway::{
    Gateway, GraphQLRequest, GraphQLResponse, LoggingMiddleware, QueryExecutor, RequestContext,
};
use tracing::info;

const GATEWAY_ADDR: &str = "127.0.0.1:8888";

const PRODUCTS_SDL: &str = r#"
    type Query {
        product(id: ID!): Product
        topProducts(first: Int = 5): [Product!]!
    }

    type Product @key(fields: "id") {
        id: ID!
        name: String!
    }
"#;

const INVENTORY_SDL: &str = r#"
    type Query {
        warehouses: [String!]!
    }

    extend type Product @key(fields: "id") {
        id: ID! @external
        price: Float!
        inStock: Boolean!
    }
"#;

#[derive(SimpleObject, Clone)]
struct Product {
    id: ID,
    name: String,
}

fn catalog() -> Vec<Product> {
    [("p1", "Widget"), ("p2", "Gadget"), ("p3", "Gizmo")]
        .into_iter()
        .map(|(id, name)| Product {
            id: ID::from(id),
            name: name.to_string(),
        })
        .collect()
}

struct ProductsQuery;

#[Object]
impl ProductsQuery {
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

#[derive(SimpleObject)]
#[graphql(name = "Product")]
struct StockedProduct {
    id: ID,
    price: f64,
    in_stock: bool,
}

struct InventoryQuery;

#[Object]
impl InventoryQuery {
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
            in_stock: id.as_str() != "p3",
            id,
            price,
        }
    }
}

/// Serves a subgraph from an async-graphql schema running in this process.
struct InProcess<Q>(Schema<Q, EmptyMutation, EmptySubscription>);

#[async_trait::async_trait]
impl<Q> QueryExecutor for InProcess<Q>
where
    Q: ObjectType + 'static,
{
    async fn execute(
        &self,
        request: GraphQLRequest,
        _ctx: &RequestContext,
    ) -> graphql_federation_gateway::Result<GraphQLResponse> {
        let variables = serde_json::Value::Object(request.variables.into_iter().collect());
        let request = async_graphql::Request::new(request.query)
            .variables(async_graphql::Variables::from_json(variables));
        let response = self.0.execute(request).await;
        Ok(serde_json::from_value(serde_json::to_value(&response)?)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let products = Schema::build(ProductsQuery, EmptyMutation, EmptySubscription)
        .enable_federation()
        .finish();
    let inventory = Schema::build(InventoryQuery, EmptyMutation, EmptySubscription)
        .enable_federation()
        .finish();

    let gateway = Gateway::builder()
        .add_subgraph("products", PRODUCTS_SDL, Arc::new(InProcess(products)))
        .add_subgraph("inventory", INVENTORY_SDL, Arc::new(InProcess(inventory)))
        .add_middleware(LoggingMiddleware)
        .build()?;

    let response = gateway
        .execute(
            GraphQLRequest::new("{ topProducts(first: 3) { name price inStock } warehouses }"),
            RequestContext::default(),
        )
        .await;
    info!("sample response: {}", serde_json::to_string_pretty(&response)?);

    info!("Gateway listening on http://{}/graphql", GATEWAY_ADDR);
    let listener = tokio::net::TcpListener::bind(GATEWAY_ADDR).await?;
    axum::serve(listener, gateway.into_router()).await?;

    Ok(())
}
