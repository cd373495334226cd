diesel::table! {
    inventory (item_id) {
        item_id -> Varchar,
        stock -> Int4,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        item_id -> Varchar,
        user_id -> Varchar,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    orders,
);
