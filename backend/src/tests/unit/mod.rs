mod pending_store;
