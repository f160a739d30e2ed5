//! MySQL persistence: entity decomposition and idempotent upserts.
//!
//! Every `persist_*` function runs inside one transaction; any statement
//! failure rolls the whole batch back. All writes use
//! `INSERT ... ON DUPLICATE KEY UPDATE`, so replaying a page is harmless.

use serde_json::Value;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::info;

use bridge_core::{
    canonical_json, InventoryRecord, OrderRecord, SalesStat, StoreRecord, WarehouseRecord,
};

pub const CRATE_NAME: &str = "bridge-store";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub async fn connect(database_url: &str) -> Result<MySqlPool, PersistError> {
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Render a value for a text column. Structured values become canonical
/// JSON, bare strings stay as-is, null becomes the empty string.
pub fn json_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

/// String lists are stored as JSON array text, matching how the loose
/// upstream fields round-trip.
pub fn json_list(items: &[String]) -> String {
    canonical_json(&Value::Array(
        items.iter().map(|s| Value::String(s.clone())).collect(),
    ))
}

const ORDERS_UPSERT: &str = r#"
    INSERT INTO orders (
        global_order_no, reference_no, store_id, order_from_name, delivery_type,
        split_type, order_status, global_purchase_time, global_payment_time,
        global_delivery_time, amount_currency, remark, global_latest_ship_time,
        global_cancel_time, update_time, order_tag, wid, warehouse_name,
        original_global_order_no, supplier_id, is_delete, order_custom_fields,
        global_create_time
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        reference_no = VALUES(reference_no),
        store_id = VALUES(store_id),
        order_from_name = VALUES(order_from_name),
        delivery_type = VALUES(delivery_type),
        split_type = VALUES(split_type),
        order_status = VALUES(order_status),
        global_purchase_time = VALUES(global_purchase_time),
        global_payment_time = VALUES(global_payment_time),
        global_delivery_time = VALUES(global_delivery_time),
        amount_currency = VALUES(amount_currency),
        remark = VALUES(remark),
        global_latest_ship_time = VALUES(global_latest_ship_time),
        global_cancel_time = VALUES(global_cancel_time),
        update_time = VALUES(update_time),
        order_tag = VALUES(order_tag),
        wid = VALUES(wid),
        warehouse_name = VALUES(warehouse_name),
        original_global_order_no = VALUES(original_global_order_no),
        supplier_id = VALUES(supplier_id),
        is_delete = VALUES(is_delete),
        order_custom_fields = VALUES(order_custom_fields),
        global_create_time = VALUES(global_create_time),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const BUYERS_UPSERT: &str = r#"
    INSERT INTO buyers_info (
        global_order_no, buyer_no, buyer_email, buyer_name, buyer_note
    ) VALUES (?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        buyer_no = VALUES(buyer_no),
        buyer_email = VALUES(buyer_email),
        buyer_name = VALUES(buyer_name),
        buyer_note = VALUES(buyer_note),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const ADDRESS_UPSERT: &str = r#"
    INSERT INTO address_info (
        global_order_no, receiver_name, receiver_mobile, receiver_tel,
        receiver_country_code, city, state_or_region, address_line1,
        address_line2, district, postal_code, doorplate_no, company_name
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        receiver_name = VALUES(receiver_name),
        receiver_mobile = VALUES(receiver_mobile),
        receiver_tel = VALUES(receiver_tel),
        receiver_country_code = VALUES(receiver_country_code),
        city = VALUES(city),
        state_or_region = VALUES(state_or_region),
        address_line1 = VALUES(address_line1),
        address_line2 = VALUES(address_line2),
        district = VALUES(district),
        postal_code = VALUES(postal_code),
        doorplate_no = VALUES(doorplate_no),
        company_name = VALUES(company_name),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const ITEMS_UPSERT: &str = r#"
    INSERT INTO item_info (
        global_order_no, global_item_no, item_id, platform_order_no,
        order_item_no, item_from_name, msku, local_sku, product_no,
        local_product_name, is_bundled, title, variant_attr,
        unit_price_amount, item_price_amount, quantity, remark,
        platform_status, item_type, stock_cost_amount, shipping_amount,
        discount_amount, tax_amount, sales_revenue_amount,
        transaction_fee_amount, other_amount, delivery_time, source_name,
        data_json, item_custom_fields, is_delete
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
              ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        item_id = VALUES(item_id),
        platform_order_no = VALUES(platform_order_no),
        order_item_no = VALUES(order_item_no),
        item_from_name = VALUES(item_from_name),
        msku = VALUES(msku),
        local_sku = VALUES(local_sku),
        product_no = VALUES(product_no),
        local_product_name = VALUES(local_product_name),
        is_bundled = VALUES(is_bundled),
        title = VALUES(title),
        variant_attr = VALUES(variant_attr),
        unit_price_amount = VALUES(unit_price_amount),
        item_price_amount = VALUES(item_price_amount),
        quantity = VALUES(quantity),
        remark = VALUES(remark),
        platform_status = VALUES(platform_status),
        item_type = VALUES(item_type),
        stock_cost_amount = VALUES(stock_cost_amount),
        shipping_amount = VALUES(shipping_amount),
        discount_amount = VALUES(discount_amount),
        tax_amount = VALUES(tax_amount),
        sales_revenue_amount = VALUES(sales_revenue_amount),
        transaction_fee_amount = VALUES(transaction_fee_amount),
        other_amount = VALUES(other_amount),
        delivery_time = VALUES(delivery_time),
        source_name = VALUES(source_name),
        data_json = VALUES(data_json),
        item_custom_fields = VALUES(item_custom_fields),
        is_delete = VALUES(is_delete),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const PLATFORM_UPSERT: &str = r#"
    INSERT INTO platform_info (
        global_order_no, order_from, platform_order_no, platform_order_name,
        platform_code, store_country_code, order_status, payment_status,
        shipping_status, purchase_time, payment_time, latest_ship_time,
        cancel_time, delivery_time
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        order_from = VALUES(order_from),
        platform_order_name = VALUES(platform_order_name),
        platform_code = VALUES(platform_code),
        store_country_code = VALUES(store_country_code),
        order_status = VALUES(order_status),
        payment_status = VALUES(payment_status),
        shipping_status = VALUES(shipping_status),
        purchase_time = VALUES(purchase_time),
        payment_time = VALUES(payment_time),
        latest_ship_time = VALUES(latest_ship_time),
        cancel_time = VALUES(cancel_time),
        delivery_time = VALUES(delivery_time),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const PAYMENT_UPSERT: &str = r#"
    INSERT INTO payment_info (
        global_order_no, platform_order_no, payment_method, transaction_no,
        currency, payment_amount, payment_time
    ) VALUES (?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        payment_method = VALUES(payment_method),
        transaction_no = VALUES(transaction_no),
        currency = VALUES(currency),
        payment_amount = VALUES(payment_amount),
        payment_time = VALUES(payment_time),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const LOGISTICS_UPSERT: &str = r#"
    INSERT INTO logistics_info (
        global_order_no, logistics_type_id, logistics_type_name,
        logistics_provider_id, logistics_provider_name, actual_carrier,
        waybill_no, pre_weight, weight, pkg_fee_weight, weight_unit,
        pkg_size_unit, cost_currency_code, pre_cost_amount, cost_amount,
        logistics_time, tracking_no, mark_no
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        logistics_type_id = VALUES(logistics_type_id),
        logistics_type_name = VALUES(logistics_type_name),
        logistics_provider_id = VALUES(logistics_provider_id),
        logistics_provider_name = VALUES(logistics_provider_name),
        actual_carrier = VALUES(actual_carrier),
        waybill_no = VALUES(waybill_no),
        pre_weight = VALUES(pre_weight),
        weight = VALUES(weight),
        pkg_fee_weight = VALUES(pkg_fee_weight),
        weight_unit = VALUES(weight_unit),
        pkg_size_unit = VALUES(pkg_size_unit),
        cost_currency_code = VALUES(cost_currency_code),
        pre_cost_amount = VALUES(pre_cost_amount),
        cost_amount = VALUES(cost_amount),
        logistics_time = VALUES(logistics_time),
        tracking_no = VALUES(tracking_no),
        mark_no = VALUES(mark_no),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const STORES_UPSERT: &str = r#"
    INSERT INTO store_info (
        store_id, sid, store_name, platform_code, platform_name,
        currency, is_sync, status, country_code
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        sid = VALUES(sid),
        store_name = VALUES(store_name),
        platform_code = VALUES(platform_code),
        platform_name = VALUES(platform_name),
        currency = VALUES(currency),
        is_sync = VALUES(is_sync),
        status = VALUES(status),
        country_code = VALUES(country_code)
"#;

const WAREHOUSES_UPSERT: &str = r#"
    INSERT INTO warehouse_info (
        wid, w_type, w_sub_type, w_name, is_delete, country_code,
        wp_id, wp_name, t_warehouse_name, t_warehouse_code,
        t_country_area_name, t_status
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        w_type = VALUES(w_type),
        w_sub_type = VALUES(w_sub_type),
        w_name = VALUES(w_name),
        is_delete = VALUES(is_delete),
        country_code = VALUES(country_code),
        wp_id = VALUES(wp_id),
        wp_name = VALUES(wp_name),
        t_warehouse_name = VALUES(t_warehouse_name),
        t_warehouse_code = VALUES(t_warehouse_code),
        t_country_area_name = VALUES(t_country_area_name),
        t_status = VALUES(t_status),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const INVENTORY_UPSERT: &str = r#"
    INSERT INTO inventory_info (
        wid, product_id, sku, seller_id, fnsku, product_total,
        product_valid_num, product_bad_num, product_lock_num,
        stock_cost_total, quantity_receive, stock_cost, product_onway,
        transit_head_cost, average_age, qty_sellable, qty_reserved,
        qty_onway, qty_pending, age_0_15_days, age_16_30_days,
        age_31_90_days, age_above_91_days, purchase_price, price,
        stock_price
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
              ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        product_id = VALUES(product_id),
        seller_id = VALUES(seller_id),
        fnsku = VALUES(fnsku),
        product_total = VALUES(product_total),
        product_valid_num = VALUES(product_valid_num),
        product_bad_num = VALUES(product_bad_num),
        product_lock_num = VALUES(product_lock_num),
        stock_cost_total = VALUES(stock_cost_total),
        quantity_receive = VALUES(quantity_receive),
        stock_cost = VALUES(stock_cost),
        product_onway = VALUES(product_onway),
        transit_head_cost = VALUES(transit_head_cost),
        average_age = VALUES(average_age),
        qty_sellable = VALUES(qty_sellable),
        qty_reserved = VALUES(qty_reserved),
        qty_onway = VALUES(qty_onway),
        qty_pending = VALUES(qty_pending),
        age_0_15_days = VALUES(age_0_15_days),
        age_16_30_days = VALUES(age_16_30_days),
        age_31_90_days = VALUES(age_31_90_days),
        age_above_91_days = VALUES(age_above_91_days),
        purchase_price = VALUES(purchase_price),
        price = VALUES(price),
        stock_price = VALUES(stock_price),
        data_updatetime = CURRENT_TIMESTAMP
"#;

const SALES_UPSERT: &str = r#"
    INSERT INTO sales_info (
        sales_code, sku, spu, spu_name, msku, msku_id, product_name, sid,
        platform_code, platform_name, site_code, site_name, store_name,
        parent_asin, platform_product_id, platform_product_title,
        currency_code, date_collect, volume_total
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE
        spu = VALUES(spu),
        spu_name = VALUES(spu_name),
        msku = VALUES(msku),
        msku_id = VALUES(msku_id),
        product_name = VALUES(product_name),
        sid = VALUES(sid),
        platform_code = VALUES(platform_code),
        platform_name = VALUES(platform_name),
        site_code = VALUES(site_code),
        site_name = VALUES(site_name),
        store_name = VALUES(store_name),
        parent_asin = VALUES(parent_asin),
        platform_product_id = VALUES(platform_product_id),
        platform_product_title = VALUES(platform_product_title),
        currency_code = VALUES(currency_code),
        date_collect = VALUES(date_collect),
        volume_total = VALUES(volume_total),
        update_time = CURRENT_TIMESTAMP
"#;

/// Persist a page of orders: the header row plus the buyer, address, line
/// item, platform, payment and logistics satellites.
pub async fn persist_orders(pool: &MySqlPool, orders: &[OrderRecord]) -> Result<usize, PersistError> {
    let mut tx = pool.begin().await?;

    for order in orders {
        sqlx::query(ORDERS_UPSERT)
            .bind(&order.global_order_no)
            .bind(&order.reference_no)
            .bind(&order.store_id)
            .bind(&order.order_from_name)
            .bind(&order.delivery_type)
            .bind(&order.split_type)
            .bind(&order.order_status)
            .bind(&order.global_purchase_time)
            .bind(&order.global_payment_time)
            .bind(&order.global_delivery_time)
            .bind(&order.amount_currency)
            .bind(&order.remark)
            .bind(&order.global_latest_ship_time)
            .bind(&order.global_cancel_time)
            .bind(&order.update_time)
            .bind(json_text(&order.order_tag))
            .bind(&order.wid)
            .bind(&order.warehouse_name)
            .bind(&order.original_global_order_no)
            .bind(&order.supplier_id)
            .bind(order.is_delete)
            .bind(json_text(&order.order_custom_fields))
            .bind(&order.global_create_time)
            .execute(&mut *tx)
            .await?;

        if let Some(buyer) = &order.buyers_info {
            sqlx::query(BUYERS_UPSERT)
                .bind(&order.global_order_no)
                .bind(&buyer.buyer_no)
                .bind(&buyer.buyer_email)
                .bind(&buyer.buyer_name)
                .bind(&buyer.buyer_note)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(address) = &order.address_info {
            sqlx::query(ADDRESS_UPSERT)
                .bind(&order.global_order_no)
                .bind(&address.receiver_name)
                .bind(&address.receiver_mobile)
                .bind(&address.receiver_tel)
                .bind(&address.receiver_country_code)
                .bind(&address.city)
                .bind(&address.state_or_region)
                .bind(&address.address_line1)
                .bind(&address.address_line2)
                .bind(&address.district)
                .bind(&address.postal_code)
                .bind(&address.doorplate_no)
                .bind(&address.company_name)
                .execute(&mut *tx)
                .await?;
        }

        for item in &order.item_info {
            sqlx::query(ITEMS_UPSERT)
                .bind(&order.global_order_no)
                .bind(&item.global_item_no)
                .bind(&item.item_id)
                .bind(&item.platform_order_no)
                .bind(&item.order_item_no)
                .bind(&item.item_from_name)
                .bind(&item.msku)
                .bind(&item.local_sku)
                .bind(&item.product_no)
                .bind(&item.local_product_name)
                .bind(item.is_bundled)
                .bind(&item.title)
                .bind(json_text(&item.variant_attr))
                .bind(item.unit_price_amount)
                .bind(item.item_price_amount)
                .bind(item.quantity)
                .bind(&item.remark)
                .bind(&item.platform_status)
                .bind(&item.item_type)
                .bind(item.stock_cost_amount)
                .bind(item.shipping_amount)
                .bind(item.discount_amount)
                .bind(item.tax_amount)
                .bind(item.sales_revenue_amount)
                .bind(item.transaction_fee_amount)
                .bind(item.other_amount)
                .bind(&item.delivery_time)
                .bind(&item.source_name)
                .bind(json_text(&item.data_json))
                .bind(json_text(&item.item_custom_fields))
                .bind(item.is_delete)
                .execute(&mut *tx)
                .await?;
        }

        for platform in &order.platform_info {
            sqlx::query(PLATFORM_UPSERT)
                .bind(&order.global_order_no)
                .bind(&platform.order_from)
                .bind(&platform.platform_order_no)
                .bind(&platform.platform_order_name)
                .bind(&platform.platform_code)
                .bind(&platform.store_country_code)
                .bind(&platform.order_status)
                .bind(&platform.payment_status)
                .bind(&platform.shipping_status)
                .bind(&platform.purchase_time)
                .bind(&platform.payment_time)
                .bind(&platform.latest_ship_time)
                .bind(&platform.cancel_time)
                .bind(&platform.delivery_time)
                .execute(&mut *tx)
                .await?;
        }

        for payment in &order.payment_info {
            sqlx::query(PAYMENT_UPSERT)
                .bind(&order.global_order_no)
                .bind(&payment.platform_order_no)
                .bind(&payment.payment_method)
                .bind(&payment.transaction_no)
                .bind(&payment.currency)
                .bind(payment.payment_amount)
                .bind(&payment.payment_time)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(logistics) = &order.logistics_info {
            sqlx::query(LOGISTICS_UPSERT)
                .bind(&order.global_order_no)
                .bind(&logistics.logistics_type_id)
                .bind(&logistics.logistics_type_name)
                .bind(&logistics.logistics_provider_id)
                .bind(&logistics.logistics_provider_name)
                .bind(&logistics.actual_carrier)
                .bind(&logistics.waybill_no)
                .bind(logistics.pre_weight)
                .bind(logistics.weight)
                .bind(logistics.pkg_fee_weight)
                .bind(&logistics.weight_unit)
                .bind(&logistics.pkg_size_unit)
                .bind(&logistics.cost_currency_code)
                .bind(logistics.pre_cost_amount)
                .bind(logistics.cost_amount)
                .bind(&logistics.logistics_time)
                .bind(&logistics.tracking_no)
                .bind(&logistics.mark_no)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    info!(orders = orders.len(), "order page persisted");
    Ok(orders.len())
}

pub async fn persist_stores(pool: &MySqlPool, stores: &[StoreRecord]) -> Result<usize, PersistError> {
    let mut tx = pool.begin().await?;

    for store in stores {
        sqlx::query(STORES_UPSERT)
            .bind(&store.store_id)
            .bind(&store.sid)
            .bind(&store.store_name)
            .bind(&store.platform_code)
            .bind(&store.platform_name)
            .bind(&store.currency)
            .bind(store.is_sync)
            .bind(store.status)
            .bind(&store.country_code)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(stores.len())
}

pub async fn persist_warehouses(
    pool: &MySqlPool,
    warehouses: &[WarehouseRecord],
) -> Result<usize, PersistError> {
    let mut tx = pool.begin().await?;

    for warehouse in warehouses {
        sqlx::query(WAREHOUSES_UPSERT)
            .bind(warehouse.wid)
            .bind(warehouse.warehouse_type)
            .bind(warehouse.sub_type)
            .bind(&warehouse.name)
            .bind(warehouse.is_delete)
            .bind(&warehouse.country_code)
            .bind(&warehouse.wp_id)
            .bind(&warehouse.wp_name)
            .bind(&warehouse.t_warehouse_name)
            .bind(&warehouse.t_warehouse_code)
            .bind(&warehouse.t_country_area_name)
            .bind(warehouse.t_status)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(warehouses.len())
}

pub async fn persist_inventory(
    pool: &MySqlPool,
    records: &[InventoryRecord],
) -> Result<usize, PersistError> {
    let mut tx = pool.begin().await?;

    for record in records {
        let ages = record.stock_ages();
        sqlx::query(INVENTORY_UPSERT)
            .bind(record.wid)
            .bind(&record.product_id)
            .bind(&record.sku)
            .bind(&record.seller_id)
            .bind(&record.fnsku)
            .bind(record.product_total)
            .bind(record.product_valid_num)
            .bind(record.product_bad_num)
            .bind(record.product_lock_num)
            .bind(record.stock_cost_total)
            .bind(record.quantity_receive)
            .bind(record.stock_cost)
            .bind(record.product_onway)
            .bind(record.transit_head_cost)
            .bind(record.average_age)
            .bind(record.third_inventory.qty_sellable)
            .bind(record.third_inventory.qty_reserved)
            .bind(record.third_inventory.qty_onway)
            .bind(record.third_inventory.qty_pending)
            .bind(ages.days_0_15)
            .bind(ages.days_16_30)
            .bind(ages.days_31_90)
            .bind(ages.days_above_91)
            .bind(record.purchase_price)
            .bind(record.price)
            .bind(record.stock_price)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(records.len())
}

pub async fn persist_sales(pool: &MySqlPool, stats: &[SalesStat]) -> Result<usize, PersistError> {
    let mut tx = pool.begin().await?;

    for stat in stats {
        sqlx::query(SALES_UPSERT)
            .bind(stat.sales_code())
            .bind(json_list(&stat.sku))
            .bind(json_list(&stat.spu))
            .bind(json_list(&stat.spu_name))
            .bind(json_list(&stat.msku))
            .bind(json_list(&stat.msku_id))
            .bind(json_list(&stat.product_name))
            .bind(json_list(&stat.sid))
            .bind(json_list(&stat.platform_code))
            .bind(json_list(&stat.platform_name))
            .bind(json_list(&stat.site_code))
            .bind(json_list(&stat.site_name))
            .bind(json_list(&stat.store_name))
            .bind(json_list(&stat.parent_asin))
            .bind(json_list(&stat.platform_product_id))
            .bind(json_list(&stat.platform_product_title))
            .bind(&stat.currency_code)
            .bind(json_text(&stat.date_collect))
            .bind(stat.volume_total)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(stats.len())
}

/// All known warehouse ids, for the inventory pull's `wid` filter.
pub async fn warehouse_ids(pool: &MySqlPool) -> Result<Vec<i64>, PersistError> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT wid FROM warehouse_info")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(wid,)| wid).collect())
}

/// Flattened order line projection read from the `orders_merge` view, the
/// shape the order export sends downstream.
#[derive(Debug, Clone, FromRow)]
pub struct OrderExportRow {
    pub global_order_no: String,
    pub global_item_no: String,
    pub platform_order_no: String,
    pub store_name: String,
    pub order_status: String,
    pub msku: String,
    pub local_sku: String,
    pub title: String,
    pub quantity: i64,
    pub unit_price_amount: f64,
    pub item_price_amount: f64,
    pub shipping_amount: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub sales_revenue_amount: f64,
    pub transaction_fee_amount: f64,
    pub amount_currency: String,
    pub global_purchase_time: String,
    pub global_payment_time: String,
    pub global_delivery_time: String,
    pub update_time: String,
    pub warehouse_name: String,
    pub logistics_provider_name: String,
    pub tracking_no: String,
}

pub async fn order_export_rows(pool: &MySqlPool) -> Result<Vec<OrderExportRow>, PersistError> {
    let rows = sqlx::query_as::<_, OrderExportRow>(
        r#"
        SELECT global_order_no, global_item_no, platform_order_no, store_name,
               order_status, msku, local_sku, title, quantity, unit_price_amount,
               item_price_amount, shipping_amount, discount_amount, tax_amount,
               sales_revenue_amount, transaction_fee_amount, amount_currency,
               global_purchase_time, global_payment_time, global_delivery_time,
               update_time, warehouse_name, logistics_provider_name, tracking_no
        FROM orders_merge
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Cancelled order lines: terminal-cancelled status with a populated cancel
/// timestamp, optionally only those cancelled after a cutoff.
#[derive(Debug, Clone, FromRow)]
pub struct CancelOrderRow {
    pub global_cancel_time: String,
    pub order_status: String,
    pub platform_order_no: String,
    pub store_id: String,
    pub store_name: String,
}

pub async fn cancel_order_rows(
    pool: &MySqlPool,
    cancelled_after: Option<&str>,
) -> Result<Vec<CancelOrderRow>, PersistError> {
    let base = r#"
        SELECT global_cancel_time, order_status, platform_order_no,
               store_id, store_name
        FROM orders_merge
        WHERE order_status = '7'
          AND global_cancel_time IS NOT NULL
          AND global_cancel_time <> ''
    "#;

    let rows = match cancelled_after {
        Some(cutoff) => {
            sqlx::query_as::<_, CancelOrderRow>(&format!(
                "{base} AND global_cancel_time > ?"
            ))
            .bind(cutoff)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, CancelOrderRow>(base)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

#[derive(Debug, Clone, FromRow)]
pub struct WarehouseExportRow {
    pub wid: i64,
    pub w_type: i64,
    pub w_sub_type: i64,
    pub w_name: String,
    pub country_code: String,
    pub wp_name: String,
    pub t_status: i64,
}

pub async fn warehouse_export_rows(
    pool: &MySqlPool,
) -> Result<Vec<WarehouseExportRow>, PersistError> {
    let rows = sqlx::query_as::<_, WarehouseExportRow>(
        r#"
        SELECT wid, w_type, w_sub_type, w_name, country_code, wp_name, t_status
        FROM warehouse_info
        WHERE is_delete = 0
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, FromRow)]
pub struct InventoryExportRow {
    pub wid: i64,
    pub sku: String,
    pub product_id: String,
    pub fnsku: String,
    pub product_total: i64,
    pub product_valid_num: i64,
    pub product_bad_num: i64,
    pub product_lock_num: i64,
    pub qty_sellable: i64,
    pub qty_reserved: i64,
    pub qty_onway: i64,
    pub qty_pending: i64,
    pub age_0_15_days: i64,
    pub age_16_30_days: i64,
    pub age_31_90_days: i64,
    pub age_above_91_days: i64,
    pub stock_cost_total: f64,
    pub average_age: i64,
}

impl InventoryExportRow {
    /// Downstream dedup key for inventory rows.
    pub fn inventory_id(&self) -> String {
        format!("{}:{}", self.wid, self.sku)
    }
}

pub async fn inventory_export_rows(
    pool: &MySqlPool,
) -> Result<Vec<InventoryExportRow>, PersistError> {
    let rows = sqlx::query_as::<_, InventoryExportRow>(
        r#"
        SELECT wid, sku, product_id, fnsku, product_total, product_valid_num,
               product_bad_num, product_lock_num, qty_sellable, qty_reserved,
               qty_onway, qty_pending, age_0_15_days, age_16_30_days,
               age_31_90_days, age_above_91_days, stock_cost_total, average_age
        FROM inventory_info
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Aggregated per-SKU sales projection from `sales_summary_daily`.
#[derive(Debug, Clone, FromRow)]
pub struct SalesSummaryRow {
    pub sku: String,
    pub store_name: String,
    pub platform_name: String,
    pub recent_3d_sales: f64,
    pub recent_7d_sales: f64,
    pub recent_15d_sales: f64,
    pub recent_30d_sales: f64,
    pub total_sales: f64,
    pub last_sale_date: String,
}

pub async fn sales_summary_rows(pool: &MySqlPool) -> Result<Vec<SalesSummaryRow>, PersistError> {
    let rows = sqlx::query_as::<_, SalesSummaryRow>(
        r#"
        SELECT sku, store_name, platform_name, recent_3d_sales, recent_7d_sales,
               recent_15d_sales, recent_30d_sales, total_sales, last_sale_date
        FROM sales_summary_daily
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_text_renders_structured_values_canonically() {
        assert_eq!(json_text(&json!({"b": 2, "a": 1})), r#"{"a":1,"b":2}"#);
        assert_eq!(json_text(&json!("bare")), "bare");
        assert_eq!(json_text(&Value::Null), "");
        assert_eq!(json_text(&json!(3.5)), "3.5");
    }

    #[test]
    fn json_list_preserves_element_order() {
        let items = vec!["B-2".to_string(), "A-1".to_string()];
        assert_eq!(json_list(&items), r#"["B-2","A-1"]"#);
        assert_eq!(json_list(&[]), "[]");
    }

    fn update_clause(sql: &str) -> &str {
        sql.split("ON DUPLICATE KEY UPDATE")
            .nth(1)
            .expect("statement has an update clause")
    }

    #[test]
    fn every_write_is_an_upsert() {
        for sql in [
            ORDERS_UPSERT,
            BUYERS_UPSERT,
            ADDRESS_UPSERT,
            ITEMS_UPSERT,
            PLATFORM_UPSERT,
            PAYMENT_UPSERT,
            LOGISTICS_UPSERT,
            STORES_UPSERT,
            WAREHOUSES_UPSERT,
            INVENTORY_UPSERT,
            SALES_UPSERT,
        ] {
            assert!(sql.contains("ON DUPLICATE KEY UPDATE"), "not an upsert: {sql}");
            // non-key columns take the second write's values on replay
            assert!(update_clause(sql).contains("VALUES("), "no column refresh: {sql}");
        }
    }

    #[test]
    fn upserts_never_reassign_their_unique_keys() {
        for (sql, keys) in [
            (ORDERS_UPSERT, &["global_order_no"][..]),
            (ITEMS_UPSERT, &["global_order_no", "global_item_no"][..]),
            (STORES_UPSERT, &["store_id"][..]),
            (WAREHOUSES_UPSERT, &["wid"][..]),
            (INVENTORY_UPSERT, &["wid", "sku"][..]),
            (SALES_UPSERT, &["sales_code"][..]),
        ] {
            let clause = update_clause(sql);
            for key in keys {
                assert!(
                    !clause.contains(&format!("{key} = VALUES({key})")),
                    "{key} must stay stable across replays"
                );
            }
        }
    }

    #[test]
    fn one_order_fans_out_to_every_satellite() {
        let order: OrderRecord = serde_json::from_value(json!({
            "global_order_no": "GO-1",
            "buyers_info": {"buyer_no": "B-1"},
            "address_info": {"city": "Berlin"},
            "item_info": [
                {"globalItemNo": "GI-1", "quantity": 1},
                {"globalItemNo": "GI-2", "quantity": 2}
            ],
            "platform_info": [{"platform_order_no": "PO-1"}],
            "payment_info": [{"transaction_no": "T-1", "payment_amount": "9.99"}],
            "logistics_info": {"tracking_no": "TRK-1"}
        }))
        .expect("decode");

        assert!(order.buyers_info.is_some());
        assert!(order.address_info.is_some());
        assert_eq!(order.item_info.len(), 2);
        assert_eq!(order.platform_info.len(), 1);
        assert_eq!(order.payment_info.len(), 1);
        assert!(order.logistics_info.is_some());
        assert_eq!(order.payment_info[0].payment_amount, 9.99);
    }

    #[test]
    fn inventory_id_joins_warehouse_and_sku() {
        let row = InventoryExportRow {
            wid: 42,
            sku: "SKU-9".into(),
            product_id: String::new(),
            fnsku: String::new(),
            product_total: 0,
            product_valid_num: 0,
            product_bad_num: 0,
            product_lock_num: 0,
            qty_sellable: 0,
            qty_reserved: 0,
            qty_onway: 0,
            qty_pending: 0,
            age_0_15_days: 0,
            age_16_30_days: 0,
            age_31_90_days: 0,
            age_above_91_days: 0,
            stock_cost_total: 0.0,
            average_age: 0,
        };
        assert_eq!(row.inventory_id(), "42:SKU-9");
    }
}
