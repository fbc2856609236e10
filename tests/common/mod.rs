pub mod modbus_mock_server;
