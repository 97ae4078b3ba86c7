//! 下单工具：校验订单并以一行 JSON 追加到订单文件

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use crate::core::ToolError;
use crate::tools::schema::parameters_for;
use crate::tools::{Tool, ToolContext};

/// 下单参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct OrderArgs {
    /// The type of pizza (e.g. 'Pepperoni', 'Margherita', 'Vegan Supreme').
    pub pizza_type: String,
    /// The size of the pizza (e.g. 'Large', 'Medium', 'Small').
    pub size: String,
    /// The number of pizzas.
    pub quantity: i64,
    /// The full delivery address.
    pub delivery_address: String,
    /// Customer's name (optional).
    #[serde(default)]
    pub customer_name: Option<String>,
    /// Customer's phone number (optional).
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Desired crust type (e.g. 'Thin', 'Regular', 'Stuffed'). Defaults to 'Regular'.
    #[serde(default)]
    pub crust_type: Option<String>,
    /// List of extra toppings (optional).
    #[serde(default)]
    pub extra_toppings: Option<Vec<String>>,
}

/// 落盘的订单记录
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub order_timestamp: String,
    pub pizza_type: String,
    pub size: String,
    pub quantity: i64,
    pub crust_type: String,
    pub extra_toppings: Vec<String>,
    pub delivery_address: String,
    pub customer_name: Option<String>,
    pub phone_number: Option<String>,
    pub session_id: String,
    pub status: String,
}

impl OrderRecord {
    fn confirmation(&self) -> String {
        let mut s = format!(
            "OK. Your order for {} x {} {} pizza(s)",
            self.quantity, self.size, self.pizza_type
        );
        if self.crust_type != "Regular" {
            s.push_str(&format!(" with {} crust", self.crust_type));
        }
        if !self.extra_toppings.is_empty() {
            s.push_str(&format!(" and extra {}", self.extra_toppings.join(", ")));
        }
        s.push_str(&format!(
            " to be delivered to '{}' has been received.",
            self.delivery_address
        ));
        s
    }
}

pub struct PlaceOrderTool {
    order_file: PathBuf,
}

impl PlaceOrderTool {
    pub fn new(order_file: impl AsRef<Path>) -> Self {
        Self {
            order_file: order_file.as_ref().to_path_buf(),
        }
    }

    fn build_record(args: OrderArgs, session_id: &str) -> Result<OrderRecord, ToolError> {
        if args.quantity <= 0 {
            return Err(ToolError::mismatch(format!(
                "Invalid quantity received: '{}'. Quantity must be a positive whole number.",
                args.quantity
            )));
        }
        let blank: Vec<&str> = [
            ("pizza_type", &args.pizza_type),
            ("size", &args.size),
            ("delivery_address", &args.delivery_address),
        ]
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| *k)
        .collect();
        if !blank.is_empty() {
            return Err(ToolError::mismatch(format!(
                "Missing required order details: {}",
                blank.join(", ")
            )));
        }

        Ok(OrderRecord {
            order_timestamp: Utc::now().to_rfc3339(),
            pizza_type: args.pizza_type.trim().to_string(),
            size: args.size.trim().to_string(),
            quantity: args.quantity,
            crust_type: args
                .crust_type
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "Regular".to_string()),
            extra_toppings: args.extra_toppings.unwrap_or_default(),
            delivery_address: args.delivery_address.trim().to_string(),
            customer_name: args.customer_name,
            phone_number: args.phone_number,
            session_id: session_id.to_string(),
            status: "Received".to_string(),
        })
    }

    async fn append(&self, record: &OrderRecord) -> std::io::Result<()> {
        if let Some(parent) = self.order_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.order_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl Tool for PlaceOrderTool {
    fn name(&self) -> &str {
        "place_order"
    }

    fn description(&self) -> &str {
        "Places a pizza order with the specified details and saves it. Use this tool ONLY when the user \
         explicitly confirms they want to place an order and has provided at least the pizza type, size, \
         quantity, and delivery address. Ask clarifying questions first if details are missing. Do not invent details."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<OrderArgs>()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: OrderArgs =
            serde_json::from_value(args).map_err(|e| ToolError::mismatch(e.to_string()))?;
        let record = Self::build_record(args, &ctx.session_id)?;

        self.append(&record).await.map_err(|e| {
            tracing::error!(path = %self.order_file.display(), "failed to save order: {}", e);
            ToolError::runtime(format!(
                "Failed to save the order due to a file system error: {e}"
            ))
        })?;
        tracing::info!(session_id = %ctx.session_id, pizza = %record.pizza_type, "order placed");

        Ok(json!({
            "status": "Order Placed Successfully",
            "confirmation": record.confirmation(),
            "order": record,
        }))
    }
}
