mod v3_client_test;
